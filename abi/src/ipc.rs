//! IPC wire types shared between the IPC core, the scheduler (which blocks
//! a thread waiting on an answerbox) and the syscall dispatch table.
//!
//! Mirrors spec.md §3 ("IPC call") and §4.5.

use crate::define_handle;

define_handle!(AnswerboxId);
define_handle!(PhoneId);
define_handle!(CallHandle);
define_handle!(IrqId);

/// Fixed-width IPC payload: a method selector plus up to five word-sized
/// arguments. Matches spec.md's "fixed-width payload (method + arguments)".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpcPayload {
    pub method: u64,
    pub args: [u64; 5],
}

impl IpcPayload {
    pub const fn new(method: u64, args: [u64; 5]) -> Self {
        Self { method, args }
    }
}

bitflags::bitflags! {
    /// Call flags word (spec.md §3: "notification / answer / forwarded").
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CallFlags: u8 {
        const NOTIFICATION = 1 << 0;
        const ANSWER       = 1 << 1;
        const FORWARDED    = 1 << 2;
    }
}

/// Phone state machine (spec.md §3): `Free → Connecting → Connected →
/// Hungup → Free`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PhoneState {
    #[default]
    Free,
    Connecting,
    Connected,
    Hungup,
}

impl PhoneState {
    pub const fn can_transition_to(self, target: Self) -> bool {
        use PhoneState::*;
        matches!(
            (self, target),
            (Free, Connecting)
                | (Connecting, Connected)
                | (Connecting, Hungup)
                | (Connected, Hungup)
                | (Hungup, Free)
        )
    }
}

pub const MAX_PHONES_PER_TASK: usize = 32;
pub const MAX_ANSWERBOXES: usize = 256;
pub const MAX_CALLS_IN_FLIGHT: usize = 1024;
pub const MAX_PENDING_PER_ANSWERBOX: usize = 64;

/// Flags accepted by `wait_event`/`sleep` callers that can tolerate a
/// non-blocking probe (spec.md §4.2, §8 boundary case).
bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SleepFlags: u8 {
        const INTERRUPTIBLE = 1 << 0;
        const NON_BLOCKING   = 1 << 1;
    }
}
