//! Kernel error kinds shared across every component boundary.
//!
//! `KError` is the single `E` type for `Result<T, KError>` everywhere in the
//! workspace. Errors are values — there are no kernel exceptions. A fault
//! that indicates kernel-internal corruption (a stale pointer, a poisoned
//! invariant) is a bug and panics by contract rather than returning a
//! `KError`; these variants are for conditions a well-behaved caller is
//! expected to observe and handle.

use core::fmt;

/// The twelve error kinds surfaced across component boundaries.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KError {
    /// Out of memory (frame allocator or kernel heap exhausted).
    NoMem = 0,
    /// No such entity (task, thread, phone, answerbox, region...).
    NoEnt = 1,
    /// Resource is busy / operation would need to wait without blocking.
    Busy = 2,
    /// The target already exists (e.g. an overlapping region).
    AlreadyExists = 3,
    /// Arguments failed validation.
    Invalid = 4,
    /// Caller lacks permission for the requested operation.
    Perm = 5,
    /// A counter or capacity would overflow.
    Overflow = 6,
    /// A memory access violated region protection or found no region.
    Fault = 7,
    /// A timed wait elapsed before its condition was satisfied.
    Timeout = 8,
    /// A blocked wait was cancelled via `interrupt_sleep`/`thread_interrupt`.
    Interrupted = 9,
    /// A non-blocking request could not complete immediately.
    WouldBlock = 10,
    /// The IPC peer (phone or answerbox) disappeared while a call was in flight.
    Hangup = 11,
}

impl KError {
    pub const fn as_str(self) -> &'static str {
        match self {
            KError::NoMem => "NoMem",
            KError::NoEnt => "NoEnt",
            KError::Busy => "Busy",
            KError::AlreadyExists => "AlreadyExists",
            KError::Invalid => "Invalid",
            KError::Perm => "Perm",
            KError::Overflow => "Overflow",
            KError::Fault => "Fault",
            KError::Timeout => "Timeout",
            KError::Interrupted => "Interrupted",
            KError::WouldBlock => "WouldBlock",
            KError::Hangup => "Hangup",
        }
    }

    /// Numeric encoding handed back to userspace from the syscall dispatch
    /// table (§6/§7: "syscalls return the error kind to userspace as an
    /// integer").
    #[inline]
    pub const fn to_raw(self) -> i64 {
        -(self as i64) - 1
    }
}

impl fmt::Display for KError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The workspace-wide result alias. Every fallible kernel-internal call
/// returns this; an unchecked failure that leads to a stale pointer or lock
/// is a bug, not a runtime condition (spec §7).
pub type KResult<T> = core::result::Result<T, KError>;
