//! Monotonic clock.
//!
//! Reads go through a registered clock-source hook — the same
//! [`crate::service_cell::ServiceCell`] idiom [`crate::waitqueue`] uses for
//! its scheduler hooks — rather than a hardwired HPET/PIT driver this
//! workspace doesn't have. Before a collaborator registers a source, every
//! accessor returns `0`.
//!
//! All functions are safe to call from any context (interrupt, kernel
//! thread, syscall handler).

use crate::service_cell::ServiceCell;

/// A clock source reports nanoseconds since an arbitrary but fixed epoch
/// (typically boot).
pub type ClockSourceFn = fn() -> u64;

static CLOCK_SOURCE: ServiceCell<ClockSourceFn> = ServiceCell::new();

/// Register the function backing [`monotonic_ns`]. Typically called once,
/// during timer/HPET bring-up.
pub fn register_clock_source(f: &'static ClockSourceFn) {
    CLOCK_SOURCE.register(f);
}

/// Returns the monotonic clock value in nanoseconds since boot, or `0` if
/// no clock source has been registered yet.
#[inline]
pub fn monotonic_ns() -> u64 {
    match CLOCK_SOURCE.get() {
        Some(f) => f(),
        None => 0,
    }
}

/// Returns system uptime in milliseconds.
#[inline]
pub fn uptime_ms() -> u64 {
    monotonic_ns() / 1_000_000
}
