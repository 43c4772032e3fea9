//! Task/thread ABI types shared between the scheduler, the address-space
//! manager, and the IPC core.
//!
//! This module holds **only** the types, constants and enums that form the
//! stable interface between kernel subsystems (spec.md §3, §4.3, §4.6).
//! Kernel-internal bookkeeping (run queues, saved register contexts) lives
//! in `mk_core::scheduler`.

use crate::define_handle;

// --- Arena capacities -------------------------------------------------------

/// Priority bands per CPU run queue (spec.md §4.3: "N ≈ 16").
pub const NUM_PRIORITY_BANDS: usize = 16;
pub const PRIORITY_HIGHEST: u8 = 0;
pub const PRIORITY_LOWEST: u8 = (NUM_PRIORITY_BANDS - 1) as u8;
pub const PRIORITY_IDLE: u8 = PRIORITY_LOWEST;

pub const MAX_CPUS: usize = 32;
pub const MAX_TASKS: usize = 256;
pub const MAX_THREADS: usize = 1024;
pub const MAX_THREADS_PER_TASK: usize = 64;
pub const TASK_NAME_MAX_LEN: usize = 32;

define_handle!(TaskId);
define_handle!(ThreadId);

// --- Thread state machine ---------------------------------------------------

/// Thread lifecycle state (spec.md §3): `Entering → Ready → Running →
/// (Sleeping | Exiting) → Lingering` (detached) or freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ThreadState {
    /// Being constructed; not yet visible to the scheduler.
    #[default]
    Entering,
    /// Waiting in a per-CPU run queue.
    Ready,
    /// Currently executing on a CPU.
    Running,
    /// Linked into exactly one wait queue (invariant 1, spec.md §8).
    Sleeping,
    /// Running its exit cascade (spec.md §4.6).
    Exiting,
    /// Detached and freed but its exit record is retained for `join`.
    Lingering,
}

impl ThreadState {
    /// Whether `self -> target` is a legal transition. Kept here as a single
    /// source of truth so `mk-core` doesn't have two copies of the state
    /// machine for the scheduler and the exit cascade to drift apart.
    pub const fn can_transition_to(self, target: Self) -> bool {
        use ThreadState::*;
        match self {
            Entering => matches!(target, Ready | Exiting),
            Ready => matches!(target, Running | Exiting),
            Running => matches!(target, Ready | Sleeping | Exiting),
            Sleeping => matches!(target, Ready | Exiting),
            Exiting => matches!(target, Lingering),
            Lingering => false,
        }
    }
}

/// Why a thread last entered [`ThreadState::Sleeping`]. Diagnostic only —
/// the actual link target is the wait queue handle carried on the thread
/// record, not this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BlockReason {
    #[default]
    None,
    Sleep,
    IpcWait,
    MutexWait,
    Join,
    Other,
}

/// Reason a thread's blocking call returned rather than completing
/// normally, mirrored onto the syscall return value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    /// `wake_one`/`wake_all` fired, or the condition was already true.
    Woken,
    /// The missed-wakeup counter was positive; no sleep occurred.
    Atomic,
    /// The timeout elapsed first.
    TimedOut,
    /// `interrupt_sleep` fired on an `INTERRUPTIBLE` sleep.
    Interrupted,
}
