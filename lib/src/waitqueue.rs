//! Wait queue primitive: the FIFO blocking/waking primitive every higher
//! synchronization construct in this workspace is built on.
//!
//! # Design
//!
//! Modeled after the teacher's `WaitQueue` (itself modeled on
//! `core/src/scheduler/futex.rs`):
//! - Fixed-capacity table of waiting thread handles, protected by an
//!   `IrqMutex` for interrupt-safe access.
//! - No direct dependency on `mk-core`: the scheduler registers a
//!   [`SchedulerHooks`] vtable through a [`ServiceCell`] at boot, the same
//!   pattern the teacher uses for `klog`'s backend — this keeps the crate
//!   graph acyclic while letting the primitive "all other synchronization
//!   is built on" live below the scheduler that uses it.
//! - A `missed_wakeups` counter closes the lost-wakeup race: a `wake_*`
//!   that finds the queue empty banks a credit; the next `sleep` spends
//!   it instead of blocking.
//!
//! # Usage
//!
//! ```rust,ignore
//! static MY_WQ: WaitQueue = WaitQueue::new();
//!
//! // Waiting side (consumer):
//! MY_WQ.wait_event(|| has_data());
//!
//! // Waking side (producer):
//! MY_WQ.wake_one();
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use mk_abi::{SleepFlags, ThreadId};

use crate::IrqMutex;
use crate::service_cell::ServiceCell;

/// Maximum number of threads that can wait on a single `WaitQueue`.
const WAITQUEUE_CAPACITY: usize = 32;

/// Outcome of a call into the scheduler to actually park the current
/// thread, once it has already been linked into a wait queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParkOutcome {
    Woken,
    TimedOut,
    Interrupted,
}

/// The set of scheduler operations `mk-lib`'s wait queue needs but cannot
/// implement itself (it knows nothing about run queues or TCBs).
/// `mk-core` registers one instance of this at boot via [`register_scheduler_hooks`].
#[derive(Clone, Copy)]
pub struct SchedulerHooks {
    /// The calling thread's identity.
    pub current_thread: fn() -> ThreadId,
    /// Mark `thread` `Sleeping` and snapshot its resume context, then
    /// actually block it (run the scheduler) — steps (a)+(b)+"call the
    /// scheduler" of the suspension discipline. Called with the wait
    /// queue lock already released (linking happened first, under that
    /// lock, in `WaitQueue::sleep`). Returns once `thread` has been woken,
    /// its timeout fired, or it was interrupted.
    pub park_current: fn(timeout_ms: Option<u64>) -> ParkOutcome,
    /// Place `thread` back on its home CPU's ready queue (with band
    /// promotion, since this is an I/O wakeup).
    pub wake: fn(thread: ThreadId),
    /// Record which `WaitQueue` `thread` is currently linked into (`None`
    /// once it unlinks for any reason) in its TCB's wait-queue link slot
    /// (spec.md §3), so a thread can be unlinked synchronously from
    /// outside its own call stack — e.g. task-exit teardown calling
    /// `Scheduler::interrupt` — instead of only being able to rely on the
    /// thread eventually resuming and unlinking itself.
    pub set_wait_queue_link: fn(thread: ThreadId, queue: Option<&'static WaitQueue>),
}

static SCHEDULER_HOOKS: ServiceCell<SchedulerHooks> = ServiceCell::new();

/// Register the scheduler's hook table. Called once by `mk-core` at boot.
pub fn register_scheduler_hooks(hooks: &'static SchedulerHooks) {
    SCHEDULER_HOOKS.register(hooks);
}

/// Outcome of [`WaitQueue::sleep`], matching the four-way (plus
/// non-blocking) contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepOutcome {
    /// Blocked and was woken by `wake_one`/`wake_all`.
    OkBlocked,
    /// A missed wakeup was already banked; no sleep occurred.
    OkAtomic,
    /// The requested timeout elapsed before a wakeup arrived.
    Timeout,
    /// `interrupt_sleep` fired while sleeping with `INTERRUPTIBLE` set.
    Interrupted,
    /// `NON_BLOCKING` was set and there was nothing to consume.
    WouldBlock,
}

#[derive(Clone, Copy)]
struct Waiter {
    thread: ThreadId,
    seq: u64,
    interruptible: bool,
}

/// Inner state of a wait queue, protected by `IrqMutex`.
struct WaitQueueInner {
    waiters: [Option<Waiter>; WAITQUEUE_CAPACITY],
    /// Monotonically increasing arrival counter; the waiter with the
    /// smallest `seq` is the FIFO head.
    next_seq: u64,
    /// Spec.md's "missed wakeups" counter: positive when a wake found the
    /// queue empty and is waiting to be claimed by the next sleeper.
    missed_wakeups: u32,
}

impl WaitQueueInner {
    const fn new() -> Self {
        Self {
            waiters: [None; WAITQUEUE_CAPACITY],
            next_seq: 0,
            missed_wakeups: 0,
        }
    }

    fn enqueue(&mut self, thread: ThreadId, interruptible: bool) -> bool {
        for slot in self.waiters.iter_mut() {
            if slot.is_none() {
                let seq = self.next_seq;
                self.next_seq = self.next_seq.wrapping_add(1);
                *slot = Some(Waiter {
                    thread,
                    seq,
                    interruptible,
                });
                return true;
            }
        }
        false
    }

    /// Remove and return the FIFO-oldest waiter, if any.
    fn dequeue_oldest(&mut self) -> Option<ThreadId> {
        let mut best: Option<(usize, u64)> = None;
        for (i, slot) in self.waiters.iter().enumerate() {
            if let Some(w) = slot {
                if best.is_none_or(|(_, seq)| w.seq < seq) {
                    best = Some((i, w.seq));
                }
            }
        }
        let (idx, _) = best?;
        let waiter = self.waiters[idx].take().unwrap();
        Some(waiter.thread)
    }

    fn dequeue_all(&mut self) -> (usize, [ThreadId; WAITQUEUE_CAPACITY]) {
        let mut out = [ThreadId::INVALID; WAITQUEUE_CAPACITY];
        let mut n = 0;
        for slot in self.waiters.iter_mut() {
            if let Some(w) = slot.take() {
                out[n] = w.thread;
                n += 1;
            }
        }
        (n, out)
    }

    /// Remove `thread` if it is still linked; returns whether it was
    /// interruptible (used by `interrupt`).
    fn remove(&mut self, thread: ThreadId) -> Option<bool> {
        for slot in self.waiters.iter_mut() {
            if matches!(slot, Some(w) if w.thread == thread) {
                let w = slot.take().unwrap();
                return Some(w.interruptible);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.waiters.iter().all(|s| s.is_none())
    }

    fn count(&self) -> usize {
        self.waiters.iter().filter(|s| s.is_some()).count()
    }
}

/// A wait queue for blocking and waking kernel threads — spec.md §4.2's
/// wait queue: "an ordered sequence of waiting threads (FIFO), a 'missed
/// wakeups' counter, and a lock".
pub struct WaitQueue {
    inner: IrqMutex<WaitQueueInner>,
    /// Monotonic counter bumped on each real (non-missed) wake, for
    /// debugging/testing.
    generation: AtomicU32,
}

impl WaitQueue {
    /// Create a new empty wait queue.
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(WaitQueueInner::new()),
            generation: AtomicU32::new(0),
        }
    }

    /// Spec.md §4.2's `sleep(wq, timeout, flags)`.
    ///
    /// Suspends the calling thread until another thread calls
    /// `wake_one`/`wake_all`, the timeout expires, or (with
    /// `INTERRUPTIBLE`) `interrupt` is called on it.
    pub fn sleep(&self, timeout_ms: Option<u64>, flags: SleepFlags) -> SleepOutcome {
        let Some(hooks) = SCHEDULER_HOOKS.get() else {
            // No scheduler registered: there is nothing that could ever
            // wake us, so never actually block.
            return SleepOutcome::WouldBlock;
        };
        let me = (hooks.current_thread)();
        let interruptible = flags.contains(SleepFlags::INTERRUPTIBLE);

        {
            let mut inner = self.inner.lock();
            if inner.missed_wakeups > 0 {
                inner.missed_wakeups -= 1;
                crate::klog_debug!("waitqueue: sleep consumed missed wakeup");
                return SleepOutcome::OkAtomic;
            }
            if flags.contains(SleepFlags::NON_BLOCKING) {
                return SleepOutcome::WouldBlock;
            }
            if !inner.enqueue(me, interruptible) {
                crate::klog_debug!("waitqueue: full, cannot enqueue");
                return SleepOutcome::WouldBlock;
            }
            // (a) mark Sleeping, (b) snapshot context, (c) already linked
            // above under this same lock. The lock is dropped when this
            // block ends, then we "call the scheduler".
            //
            // SAFETY: the address recorded here is only read back while
            // `me` remains linked in this queue, which is only while this
            // stack frame (and therefore `self`, whether it's a `'static`
            // or a local throwaway queue) is still suspended, not unwound.
            // Every path that removes `me` from this queue also clears the
            // link slot first (see `wake_one`/`wake_all` and
            // `mk_core::task::ThreadTable::unlink_wait_queue`).
            let static_self: &'static WaitQueue = unsafe { core::mem::transmute(self) };
            (hooks.set_wait_queue_link)(me, Some(static_self));
        }

        crate::klog_debug!("waitqueue: thread blocking, timeout={:?}", timeout_ms);
        match (hooks.park_current)(timeout_ms) {
            ParkOutcome::Woken => SleepOutcome::OkBlocked,
            ParkOutcome::TimedOut => {
                // Race between timeout and wake: if we're still linked,
                // the timeout wins and we remove ourselves. If a wake
                // already dequeued us, wake wins silently.
                let mut inner = self.inner.lock();
                if inner.remove(me).is_some() {
                    crate::klog_debug!("waitqueue: timed out");
                    SleepOutcome::Timeout
                } else {
                    SleepOutcome::OkBlocked
                }
            }
            ParkOutcome::Interrupted => {
                let mut inner = self.inner.lock();
                inner.remove(me);
                crate::klog_debug!("waitqueue: interrupted");
                SleepOutcome::Interrupted
            }
        }
    }

    /// `wake_one(wq)`: dequeue the longest-waiting thread (FIFO) and place
    /// it on its home CPU's ready queue; if none is waiting, bank a
    /// missed wakeup.
    pub fn wake_one(&self) -> bool {
        let woken = {
            let mut inner = self.inner.lock();
            match inner.dequeue_oldest() {
                Some(thread) => Some(thread),
                None => {
                    inner.missed_wakeups = inner.missed_wakeups.saturating_add(1);
                    None
                }
            }
        };

        match woken {
            Some(thread) => {
                self.generation.fetch_add(1, Ordering::Relaxed);
                if let Some(hooks) = SCHEDULER_HOOKS.get() {
                    (hooks.set_wait_queue_link)(thread, None);
                    (hooks.wake)(thread);
                }
                true
            }
            None => false,
        }
    }

    /// `wake_all(wq)`: wake every waiter; on an empty queue, bank exactly
    /// one missed wakeup (not one per absent waiter).
    pub fn wake_all(&self) -> usize {
        let (count, threads) = {
            let mut inner = self.inner.lock();
            let (count, threads) = inner.dequeue_all();
            if count == 0 {
                inner.missed_wakeups = inner.missed_wakeups.saturating_add(1);
            }
            (count, threads)
        };

        if count > 0 {
            self.generation.fetch_add(1, Ordering::Relaxed);
            if let Some(hooks) = SCHEDULER_HOOKS.get() {
                for &thread in &threads[..count] {
                    (hooks.set_wait_queue_link)(thread, None);
                    (hooks.wake)(thread);
                }
            }
        }
        count
    }

    /// `interrupt_sleep(thread)`: affects `thread` only if it is currently
    /// linked in *this* queue with `INTERRUPTIBLE` set; otherwise a silent
    /// no-op. (The thread's TCB wait-queue link slot is what lets a
    /// caller find the right `WaitQueue` to call this on.)
    pub fn interrupt(&self, thread: ThreadId) -> bool {
        let was_interruptible = {
            let mut inner = self.inner.lock();
            match inner.waiters.iter().find(|s| matches!(s, Some(w) if w.thread == thread)) {
                Some(Some(w)) if w.interruptible => {
                    inner.remove(thread);
                    true
                }
                // Not interruptible, or not linked here at all: leave the
                // waiter exactly where it is. A true no-op, not a
                // remove-then-reinsert, since the latter would move it to
                // the back of FIFO order.
                _ => false,
            }
        };

        if was_interruptible {
            if let Some(hooks) = SCHEDULER_HOOKS.get() {
                (hooks.set_wait_queue_link)(thread, None);
                (hooks.wake)(thread);
            }
        }
        was_interruptible
    }

    /// Remove a specific thread from the wait queue unconditionally (e.g.
    /// task teardown while a thread is still linked).
    pub fn remove(&self, thread: ThreadId) -> bool {
        self.inner.lock().remove(thread).is_some()
    }

    /// Block the current thread until `condition()` returns `true`, using
    /// `sleep`/`wake_one` under the hood. Convenience wrapper matching the
    /// teacher's `wait_event` ergonomics.
    pub fn wait_event<F: Fn() -> bool>(&self, condition: F) -> bool {
        loop {
            if condition() {
                return true;
            }
            match self.sleep(None, SleepFlags::empty()) {
                SleepOutcome::OkBlocked | SleepOutcome::OkAtomic => {}
                SleepOutcome::WouldBlock | SleepOutcome::Timeout | SleepOutcome::Interrupted => {
                    return false;
                }
            }
        }
    }

    /// As [`Self::wait_event`], but gives up after `timeout_ms`.
    pub fn wait_event_timeout<F: Fn() -> bool>(&self, condition: F, timeout_ms: u64) -> bool {
        if condition() {
            return true;
        }
        match self.sleep(Some(timeout_ms), SleepFlags::empty()) {
            SleepOutcome::OkBlocked | SleepOutcome::OkAtomic => condition(),
            SleepOutcome::WouldBlock | SleepOutcome::Timeout | SleepOutcome::Interrupted => false,
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.inner.lock().is_empty()
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().count()
    }

    pub fn missed_wakeups(&self) -> u32 {
        self.inner.lock().missed_wakeups
    }

    /// Get the wake generation counter (for debugging / testing).
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    fn test_thread(n: u32) -> ThreadId {
        ThreadId(mk_abi::RawHandle::new(n, 0))
    }

    static WAKE_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn noop_current() -> ThreadId {
        test_thread(0)
    }
    fn noop_park(_timeout_ms: Option<u64>) -> ParkOutcome {
        ParkOutcome::Woken
    }
    fn counting_wake(_thread: ThreadId) {
        WAKE_CALLS.fetch_add(1, Ordering::Relaxed);
    }
    fn noop_set_link(_thread: ThreadId, _queue: Option<&'static WaitQueue>) {}

    static HOOKS: SchedulerHooks = SchedulerHooks {
        current_thread: noop_current,
        park_current: noop_park,
        wake: counting_wake,
        set_wait_queue_link: noop_set_link,
    };

    #[test]
    fn wake_one_on_empty_queue_banks_missed_wakeup() {
        register_scheduler_hooks(&HOOKS);
        let wq = WaitQueue::new();
        assert!(!wq.wake_one());
        assert_eq!(wq.missed_wakeups(), 1);
    }

    #[test]
    fn sleep_consumes_missed_wakeup_as_ok_atomic() {
        register_scheduler_hooks(&HOOKS);
        let wq = WaitQueue::new();
        wq.wake_one();
        assert_eq!(wq.sleep(None, SleepFlags::empty()), SleepOutcome::OkAtomic);
        assert_eq!(wq.missed_wakeups(), 0);
    }

    #[test]
    fn non_blocking_sleep_on_empty_queue_would_block() {
        register_scheduler_hooks(&HOOKS);
        let wq = WaitQueue::new();
        assert_eq!(
            wq.sleep(None, SleepFlags::NON_BLOCKING),
            SleepOutcome::WouldBlock
        );
    }

    #[test]
    fn fifo_order_is_oldest_first() {
        let mut inner = WaitQueueInner::new();
        inner.enqueue(test_thread(1), false);
        inner.enqueue(test_thread(2), false);
        inner.enqueue(test_thread(3), false);
        assert_eq!(inner.dequeue_oldest(), Some(test_thread(1)));
        assert_eq!(inner.dequeue_oldest(), Some(test_thread(2)));
        assert_eq!(inner.dequeue_oldest(), Some(test_thread(3)));
        assert_eq!(inner.dequeue_oldest(), None);
    }

    #[test]
    fn remove_takes_specific_waiter_out_of_order() {
        let mut inner = WaitQueueInner::new();
        inner.enqueue(test_thread(1), false);
        inner.enqueue(test_thread(2), true);
        assert_eq!(inner.remove(test_thread(2)), Some(true));
        assert_eq!(inner.dequeue_oldest(), Some(test_thread(1)));
    }

    #[test]
    fn interrupt_on_non_interruptible_waiter_is_true_noop() {
        register_scheduler_hooks(&HOOKS);
        let wq = WaitQueue::new();
        wq.inner.lock().enqueue(test_thread(1), false);
        wq.inner.lock().enqueue(test_thread(2), false);

        assert!(!wq.interrupt(test_thread(1)));

        // FIFO order must be unchanged: thread 1 is still the oldest
        // waiter, not bumped to the back.
        assert_eq!(wq.inner.lock().dequeue_oldest(), Some(test_thread(1)));
        assert_eq!(wq.inner.lock().dequeue_oldest(), Some(test_thread(2)));
    }

    #[test]
    fn interrupt_on_interruptible_waiter_unlinks_and_wakes() {
        register_scheduler_hooks(&HOOKS);
        let wq = WaitQueue::new();
        wq.inner.lock().enqueue(test_thread(1), true);
        let before = WAKE_CALLS.load(Ordering::Relaxed);

        assert!(wq.interrupt(test_thread(1)));

        assert!(wq.inner.lock().is_empty());
        assert_eq!(WAKE_CALLS.load(Ordering::Relaxed), before + 1);
    }
}
