//! Per-CPU priority-band run queues (spec.md §4.3).
//!
//! Grounded on the teacher's `scheduler/per_cpu.rs` `ReadyQueue` (one
//! instance per CPU, cache-friendly, lock-protected) but stored as a fixed
//! array of [`mk_abi::task::ThreadId`] instead of an intrusive pointer
//! list through raw `*mut Task`, the same storage swap `mk-mm` made for
//! its region tree. Threads enter and are selected from the head of their
//! band (spec.md: "new/requeued threads enter at the head of their band;
//! selection always takes the head of the highest-priority non-empty
//! band"), so each band is a plain bounded stack, not a FIFO.

use mk_abi::task::{NUM_PRIORITY_BANDS, ThreadId};
use mk_lib::IrqMutex;

/// Threads a single band can hold before `enqueue` starts rejecting.
const BAND_CAPACITY: usize = 64;
/// Upper bound on how many threads one `steal_batch` call takes at once.
pub const STEAL_BATCH_MAX: usize = 8;

#[derive(Clone, Copy)]
struct BandStack {
    items: [ThreadId; BAND_CAPACITY],
    len: usize,
}

impl BandStack {
    const fn new() -> Self {
        Self {
            items: [ThreadId::INVALID; BAND_CAPACITY],
            len: 0,
        }
    }

    fn push(&mut self, thread: ThreadId) -> bool {
        if self.len >= BAND_CAPACITY {
            return false;
        }
        self.items[self.len] = thread;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<ThreadId> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.items[self.len])
    }

    /// Steal up to `max` threads from the opposite (oldest) end of the
    /// band, shifting the remainder down. Leaves the thief's target band
    /// selection order untouched for what stays behind.
    fn steal_from_tail(&mut self, max: usize, out: &mut [ThreadId]) -> usize {
        let take = max.min(self.len).min(out.len());
        if take == 0 {
            return 0;
        }
        out[..take].copy_from_slice(&self.items[..take]);
        self.items.copy_within(take..self.len, 0);
        self.len -= take;
        take
    }
}

struct RunQueueInner {
    bands: [BandStack; NUM_PRIORITY_BANDS],
    count: u32,
}

impl RunQueueInner {
    const fn new() -> Self {
        const BAND: BandStack = BandStack::new();
        Self {
            bands: [BAND; NUM_PRIORITY_BANDS],
            count: 0,
        }
    }
}

/// One CPU's set of priority-band run queues.
pub struct RunQueue {
    inner: IrqMutex<RunQueueInner>,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new_named(RunQueueInner::new(), "run_queue"),
        }
    }

    /// Insert `thread` at the head of `band` (clamped to the valid range).
    pub fn enqueue(&self, thread: ThreadId, band: u8) -> bool {
        let band = (band as usize).min(NUM_PRIORITY_BANDS - 1);
        let mut inner = self.inner.lock();
        let ok = inner.bands[band].push(thread);
        if ok {
            inner.count += 1;
        }
        ok
    }

    /// Remove and return the head thread of the highest-priority
    /// non-empty band, plus the band it came from.
    pub fn pick_next(&self) -> Option<(ThreadId, u8)> {
        let mut inner = self.inner.lock();
        for band in 0..NUM_PRIORITY_BANDS {
            if let Some(thread) = inner.bands[band].pop() {
                inner.count -= 1;
                return Some((thread, band as u8));
            }
        }
        None
    }

    pub fn len(&self) -> u32 {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Steal up to `STEAL_BATCH_MAX` threads total, scanning bands by
    /// increasing number (spec.md: "scan peers by increasing priority
    /// band"). Returns the stolen threads and the band each came from.
    pub fn steal_batch(&self, out: &mut [(ThreadId, u8); STEAL_BATCH_MAX]) -> usize {
        let mut inner = self.inner.lock();
        let mut taken = 0;
        for band in 0..NUM_PRIORITY_BANDS {
            if taken >= STEAL_BATCH_MAX {
                break;
            }
            let mut scratch = [ThreadId::INVALID; STEAL_BATCH_MAX];
            let n = inner.bands[band].steal_from_tail(STEAL_BATCH_MAX - taken, &mut scratch);
            for t in scratch.iter().take(n) {
                out[taken] = (*t, band as u8);
                taken += 1;
            }
        }
        inner.count -= taken as u32;
        taken
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u32) -> ThreadId {
        ThreadId::new(n, 0)
    }

    #[test]
    fn selection_picks_highest_priority_nonempty_band_head() {
        let rq = RunQueue::new();
        rq.enqueue(tid(1), 5);
        rq.enqueue(tid(2), 2);
        rq.enqueue(tid(3), 2);
        let (first, band) = rq.pick_next().unwrap();
        assert_eq!(band, 2);
        assert_eq!(first, tid(3)); // last inserted into band 2 is the head
    }

    #[test]
    fn insertion_and_selection_are_both_head_of_band() {
        let rq = RunQueue::new();
        rq.enqueue(tid(10), 4);
        rq.enqueue(tid(11), 4);
        rq.enqueue(tid(12), 4);
        assert_eq!(rq.pick_next().unwrap().0, tid(12));
        assert_eq!(rq.pick_next().unwrap().0, tid(11));
        assert_eq!(rq.pick_next().unwrap().0, tid(10));
        assert!(rq.pick_next().is_none());
    }

    #[test]
    fn band_is_clamped_to_valid_range() {
        let rq = RunQueue::new();
        assert!(rq.enqueue(tid(1), 255));
        let (_, band) = rq.pick_next().unwrap();
        assert_eq!(band as usize, NUM_PRIORITY_BANDS - 1);
    }

    #[test]
    fn steal_batch_takes_from_tail_oldest_first() {
        let rq = RunQueue::new();
        rq.enqueue(tid(1), 3);
        rq.enqueue(tid(2), 3);
        rq.enqueue(tid(3), 3);
        let mut out = [(ThreadId::INVALID, 0u8); STEAL_BATCH_MAX];
        let n = rq.steal_batch(&mut out);
        assert_eq!(n, 3);
        // tail-first: thread 1 was pushed first, so it's at the tail.
        assert_eq!(out[0].0, tid(1));
        assert_eq!(out[1].0, tid(2));
        assert_eq!(out[2].0, tid(3));
        assert!(rq.is_empty());
    }

    #[test]
    fn steal_batch_respects_cap_per_call() {
        let rq = RunQueue::new();
        for i in 0..(STEAL_BATCH_MAX as u32 + 3) {
            rq.enqueue(tid(i), 1);
        }
        let mut out = [(ThreadId::INVALID, 0u8); STEAL_BATCH_MAX];
        let n = rq.steal_batch(&mut out);
        assert_eq!(n, STEAL_BATCH_MAX);
        assert_eq!(rq.len() as usize, 3);
    }
}
