//! Task and thread records (spec.md §3, §4.6).
//!
//! Grounded on the teacher's `scheduler/task_struct.rs` for the split
//! between ABI-stable fields (kept in `mk_abi::task`) and kernel-internal
//! bookkeeping, but the storage itself is `mk-mm`'s `AddressSpaceManager`
//! idiom rather than the teacher's raw intrusive pointers: a fixed-capacity
//! table behind one lock, generation-checked handles instead of pointer
//! validity checks.
//!
//! A task owns an address space (`mk-mm`), a phone table and primary
//! answerbox (`mk-ipc`), and a thread count. A thread is a schedulable unit
//! belonging to exactly one task, tracked here by state and priority band
//! only — the actual CPU register context is out of scope (arch layer).

use mk_abi::error::{KError, KResult};
use mk_abi::ipc::AnswerboxId;
use mk_abi::mm::Asid;
use mk_abi::task::{
    BlockReason, MAX_TASKS, MAX_THREADS, MAX_THREADS_PER_TASK, TASK_NAME_MAX_LEN, TaskId, ThreadId,
    ThreadState,
};
use mk_ipc::PhoneTable;
use mk_lib::{IrqMutex, WaitQueue, klog_debug};

/// Cap on how many expired sleepers [`ThreadTable::for_each_expired_sleeper`]
/// reports per call; any excess is caught on the next timer tick.
const EXPIRED_SLEEPERS_BATCH: usize = 64;

/// A task: an address space, a phone table, and a primary answerbox.
pub struct TaskRecord {
    pub asid: Asid,
    pub phones: PhoneTable,
    pub answerbox: AnswerboxId,
    pub thread_count: u32,
    threads: [ThreadId; MAX_THREADS_PER_TASK],
    name: [u8; TASK_NAME_MAX_LEN],
    name_len: u8,
}

impl TaskRecord {
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    /// Copy out every live thread id belonging to this task (used by exit
    /// teardown, which can't hold the task table lock while it calls into
    /// the scheduler for each one).
    pub fn snapshot_threads(&self) -> ([ThreadId; MAX_THREADS_PER_TASK], usize) {
        let n = (self.thread_count as usize).min(MAX_THREADS_PER_TASK);
        (self.threads, n)
    }
}

#[derive(Clone, Copy)]
struct TaskSlotMeta {
    occupied: bool,
    generation: u32,
    next_free: u32,
}

struct TaskTableInner {
    meta: [TaskSlotMeta; MAX_TASKS],
    data: [Option<TaskRecord>; MAX_TASKS],
    free_head: u32,
}

/// The global task table. One instance per kernel.
pub struct TaskTable {
    inner: IrqMutex<TaskTableInner>,
}

impl TaskTable {
    pub const fn new() -> Self {
        const META: TaskSlotMeta = TaskSlotMeta {
            occupied: false,
            generation: 0,
            next_free: 0,
        };
        const NONE: Option<TaskRecord> = None;
        let mut meta = [META; MAX_TASKS];
        let mut i = 0;
        while i < MAX_TASKS {
            meta[i].next_free = (i as u32) + 1;
            i += 1;
        }
        Self {
            inner: IrqMutex::new_named(
                TaskTableInner {
                    meta,
                    data: [NONE; MAX_TASKS],
                    free_head: 0,
                },
                "task_table",
            ),
        }
    }

    pub fn create(&self, asid: Asid, answerbox: AnswerboxId, name: &str) -> KResult<TaskId> {
        let mut inner = self.inner.lock();
        let idx = inner.free_head as usize;
        if idx >= MAX_TASKS {
            return Err(KError::NoMem);
        }
        let generation = inner.meta[idx].generation;
        inner.free_head = inner.meta[idx].next_free;
        inner.meta[idx].occupied = true;

        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_MAX_LEN);
        let mut name_buf = [0u8; TASK_NAME_MAX_LEN];
        name_buf[..len].copy_from_slice(&bytes[..len]);

        inner.data[idx] = Some(TaskRecord {
            asid,
            phones: PhoneTable::new(),
            answerbox,
            thread_count: 0,
            threads: [ThreadId::INVALID; MAX_THREADS_PER_TASK],
            name: name_buf,
            name_len: len as u8,
        });
        klog_debug!("task: created {} at slot {}", name, idx);
        Ok(TaskId::new(idx as u32, generation))
    }

    pub fn destroy(&self, id: TaskId) -> KResult<TaskRecord> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get_mut(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = inner.free_head;
        inner.free_head = idx as u32;
        let record = inner.data[idx].take().ok_or(KError::NoEnt)?;
        klog_debug!("task: destroyed slot {}", idx);
        Ok(record)
    }

    pub fn with_task<R>(&self, id: TaskId, f: impl FnOnce(&TaskRecord) -> R) -> KResult<R> {
        let idx = id.index() as usize;
        let inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        inner.data[idx].as_ref().map(f).ok_or(KError::NoEnt)
    }

    /// Record a newly spawned thread against its owning task.
    pub fn add_thread(&self, id: TaskId, thread: ThreadId) -> KResult<()> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        let record = inner.data[idx].as_mut().ok_or(KError::NoEnt)?;
        let count = record.thread_count as usize;
        if count >= MAX_THREADS_PER_TASK {
            return Err(KError::NoMem);
        }
        record.threads[count] = thread;
        record.thread_count += 1;
        Ok(())
    }

    /// Drop a thread from its task's bookkeeping (by swap-remove against
    /// the live prefix) and return the task's remaining thread count.
    pub fn remove_thread(&self, id: TaskId, thread: ThreadId) -> KResult<u32> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        let record = inner.data[idx].as_mut().ok_or(KError::NoEnt)?;
        let count = record.thread_count as usize;
        if let Some(pos) = record.threads[..count].iter().position(|&t| t == thread) {
            record.threads[pos] = record.threads[count - 1];
            record.threads[count - 1] = ThreadId::INVALID;
            record.thread_count -= 1;
        }
        Ok(record.thread_count)
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread: which task it belongs to, its lifecycle state, priority band,
/// and last-blocking reason. No saved register context — that belongs to
/// the arch/boot layer's context-switch machinery, out of scope here.
#[derive(Clone, Copy)]
pub struct ThreadRecord {
    pub task: TaskId,
    pub state: ThreadState,
    pub band: u8,
    pub home_cpu: u32,
    pub block_reason: BlockReason,
    /// Set by [`crate::scheduler::Scheduler::interrupt`]; consumed (and
    /// cleared) the next time this thread reaches a preemption or sleep
    /// point (spec.md §4.3: "cancellation is cooperative... observed at
    /// the next preemption or sleep point").
    pub interrupt_pending: bool,
    /// The wait-queue link slot (spec.md §3: a thread "bears ... a
    /// wait-queue link slot"): the address of the [`WaitQueue`] this
    /// thread is currently linked into, set by `mk_lib::WaitQueue::sleep`
    /// through the scheduler hooks and cleared on every unlink path. Lets
    /// teardown/interrupt find and unlink a thread from its *real* queue
    /// synchronously instead of trusting the thread to unlink itself once
    /// resumed.
    wait_queue_link: Option<usize>,
    /// Absolute deadline (monotonic ms since boot) armed by
    /// `mk_lib::WaitQueue::sleep` when it parks with a timeout. `None`
    /// means no timeout is armed for this thread's current sleep.
    sleep_deadline_ms: Option<u64>,
    /// Set by [`crate::scheduler::Scheduler::check_timeouts`]; consumed
    /// (and cleared) by `hook_park_current` the same way
    /// `interrupt_pending` is, to surface `ParkOutcome::TimedOut`.
    timeout_pending: bool,
}

impl ThreadRecord {
    const fn empty() -> Self {
        Self {
            task: TaskId::INVALID,
            state: ThreadState::Entering,
            band: 0,
            home_cpu: 0,
            block_reason: BlockReason::None,
            interrupt_pending: false,
            wait_queue_link: None,
            sleep_deadline_ms: None,
            timeout_pending: false,
        }
    }
}

#[derive(Clone, Copy)]
struct ThreadSlotMeta {
    occupied: bool,
    generation: u32,
    next_free: u32,
}

struct ThreadTableInner {
    meta: [ThreadSlotMeta; MAX_THREADS],
    data: [ThreadRecord; MAX_THREADS],
    free_head: u32,
}

/// The global thread table. One instance per kernel, owned by the
/// scheduler since every mutation (state, band) is a scheduling decision.
pub struct ThreadTable {
    inner: IrqMutex<ThreadTableInner>,
}

impl ThreadTable {
    pub const fn new() -> Self {
        const META: ThreadSlotMeta = ThreadSlotMeta {
            occupied: false,
            generation: 0,
            next_free: 0,
        };
        const EMPTY: ThreadRecord = ThreadRecord::empty();
        let mut meta = [META; MAX_THREADS];
        let mut i = 0;
        while i < MAX_THREADS {
            meta[i].next_free = (i as u32) + 1;
            i += 1;
        }
        Self {
            inner: IrqMutex::new_named(
                ThreadTableInner {
                    meta,
                    data: [EMPTY; MAX_THREADS],
                    free_head: 0,
                },
                "thread_table",
            ),
        }
    }

    pub fn create(&self, task: TaskId, band: u8, home_cpu: u32) -> KResult<ThreadId> {
        let mut inner = self.inner.lock();
        let idx = inner.free_head as usize;
        if idx >= MAX_THREADS {
            return Err(KError::NoMem);
        }
        let generation = inner.meta[idx].generation;
        inner.free_head = inner.meta[idx].next_free;
        inner.meta[idx].occupied = true;
        inner.data[idx] = ThreadRecord {
            task,
            state: ThreadState::Entering,
            band,
            home_cpu,
            block_reason: BlockReason::None,
            interrupt_pending: false,
            wait_queue_link: None,
            sleep_deadline_ms: None,
            timeout_pending: false,
        };
        Ok(ThreadId::new(idx as u32, generation))
    }

    pub fn destroy(&self, id: ThreadId) -> KResult<ThreadRecord> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get_mut(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = inner.free_head;
        inner.free_head = idx as u32;
        let record = inner.data[idx];
        inner.data[idx] = ThreadRecord::empty();
        Ok(record)
    }

    pub fn get(&self, id: ThreadId) -> Option<ThreadRecord> {
        let idx = id.index() as usize;
        let inner = self.inner.lock();
        let slot = inner.meta.get(idx)?;
        if slot.occupied && slot.generation == id.generation() {
            Some(inner.data[idx])
        } else {
            None
        }
    }

    /// Move `id` to `target` state if the transition is legal
    /// ([`ThreadState::can_transition_to`]); otherwise `KError::Invalid`.
    pub fn transition(&self, id: ThreadId, target: ThreadState) -> KResult<()> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        let record = &mut inner.data[idx];
        if !record.state.can_transition_to(target) {
            return Err(KError::Invalid);
        }
        record.state = target;
        Ok(())
    }

    pub fn set_band(&self, id: ThreadId, band: u8) -> KResult<()> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        inner.data[idx].band = band;
        Ok(())
    }

    pub fn set_block_reason(&self, id: ThreadId, reason: BlockReason) -> KResult<()> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        inner.data[idx].block_reason = reason;
        Ok(())
    }

    /// Set the pending-interrupt flag; returns whether the thread was
    /// `Sleeping` at the time (the caller uses this to decide whether to
    /// wake it immediately).
    pub fn mark_interrupt_pending(&self, id: ThreadId) -> KResult<bool> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        let record = &mut inner.data[idx];
        record.interrupt_pending = true;
        Ok(record.state == ThreadState::Sleeping)
    }

    /// Read and clear the pending-interrupt flag (consumed at a
    /// preemption or sleep point).
    pub fn take_interrupt_pending(&self, id: ThreadId) -> bool {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let Some(slot) = inner.meta.get(idx) else {
            return false;
        };
        if !slot.occupied || slot.generation != id.generation() {
            return false;
        }
        let pending = inner.data[idx].interrupt_pending;
        inner.data[idx].interrupt_pending = false;
        pending
    }

    /// Set (or clear, with `None`) the wait-queue link slot.
    pub fn set_wait_queue_link(&self, id: ThreadId, queue: Option<&'static WaitQueue>) -> KResult<()> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        inner.data[idx].wait_queue_link = queue.map(|q| q as *const WaitQueue as usize);
        Ok(())
    }

    /// Synchronously unlink `id` from whatever `WaitQueue` its link slot
    /// names, if any, clearing the slot. Used by teardown/interrupt paths
    /// that must not wait for the target thread to unlink itself once
    /// resumed (see `Scheduler::interrupt`).
    pub fn unlink_wait_queue(&self, id: ThreadId) -> KResult<()> {
        let idx = id.index() as usize;
        let wq = {
            let mut inner = self.inner.lock();
            let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
            if !slot.occupied || slot.generation != id.generation() {
                return Err(KError::NoEnt);
            }
            let record = &mut inner.data[idx];
            let link = record.wait_queue_link.take();
            // SAFETY: the address was produced from a live `&'static
            // WaitQueue` by `set_wait_queue_link` and is only read back
            // here, while the thread is still linked into it; every
            // unlink path (here, `wake_one`, `wake_all`) clears the slot
            // as it removes the thread, so no other reader can observe a
            // stale address after the queue itself is gone.
            link.map(|addr| unsafe { &*(addr as *const WaitQueue) })
        };
        if let Some(wq) = wq {
            wq.remove(id);
        }
        Ok(())
    }

    /// Arm (or disarm, with `None`) the sleep-timeout deadline.
    pub fn set_sleep_deadline(&self, id: ThreadId, deadline_ms: Option<u64>) -> KResult<()> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        inner.data[idx].sleep_deadline_ms = deadline_ms;
        Ok(())
    }

    /// Invoke `f` for every `Sleeping` thread whose armed deadline has
    /// passed `now_ms`, up to [`EXPIRED_SLEEPERS_BATCH`] per call (any
    /// excess is still expired and gets caught on the next tick — the
    /// table can hold up to [`mk_abi::task::MAX_THREADS`] entries, too
    /// many to size a stack array for at once, and `f` is called with the
    /// table lock released since it typically re-locks the table itself).
    pub fn for_each_expired_sleeper(&self, now_ms: u64, mut f: impl FnMut(ThreadId)) {
        let mut batch = [ThreadId::INVALID; EXPIRED_SLEEPERS_BATCH];
        let mut n = 0;
        {
            let inner = self.inner.lock();
            for (idx, slot) in inner.meta.iter().enumerate() {
                if n >= batch.len() {
                    break;
                }
                if !slot.occupied {
                    continue;
                }
                let record = &inner.data[idx];
                if record.state == ThreadState::Sleeping
                    && record.sleep_deadline_ms.is_some_and(|d| d <= now_ms)
                {
                    batch[n] = ThreadId::new(idx as u32, slot.generation);
                    n += 1;
                }
            }
        }
        for &id in &batch[..n] {
            f(id);
        }
    }

    /// Mark the pending-timeout flag and disarm the deadline; returns
    /// whether the thread was still `Sleeping` (mirrors
    /// `mark_interrupt_pending`).
    pub fn mark_timeout_pending(&self, id: ThreadId) -> KResult<bool> {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let slot = inner.meta.get(idx).ok_or(KError::NoEnt)?;
        if !slot.occupied || slot.generation != id.generation() {
            return Err(KError::NoEnt);
        }
        let record = &mut inner.data[idx];
        record.timeout_pending = true;
        record.sleep_deadline_ms = None;
        Ok(record.state == ThreadState::Sleeping)
    }

    /// Read and clear the pending-timeout flag (consumed at the next
    /// park point, same as `take_interrupt_pending`).
    pub fn take_timeout_pending(&self, id: ThreadId) -> bool {
        let idx = id.index() as usize;
        let mut inner = self.inner.lock();
        let Some(slot) = inner.meta.get(idx) else {
            return false;
        };
        if !slot.occupied || slot.generation != id.generation() {
            return false;
        }
        let pending = inner.data[idx].timeout_pending;
        inner.data[idx].timeout_pending = false;
        pending
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_create_destroy_round_trips() {
        let table = TaskTable::new();
        let id = table
            .create(Asid(1), AnswerboxId::INVALID, "init")
            .unwrap();
        assert!(table.with_task(id, |t| t.name() == "init").unwrap());
        table.destroy(id).unwrap();
        assert!(table.with_task(id, |_| ()).is_err());
    }

    #[test]
    fn thread_legal_transitions_succeed_and_illegal_are_rejected() {
        let table = ThreadTable::new();
        let id = table.create(TaskId::new(0, 0), 8, 0).unwrap();
        table.transition(id, ThreadState::Ready).unwrap();
        table.transition(id, ThreadState::Running).unwrap();
        let err = table.transition(id, ThreadState::Lingering).unwrap_err();
        assert_eq!(err, KError::Invalid);
    }

    #[test]
    fn interrupt_pending_is_set_and_consumed_once() {
        let table = ThreadTable::new();
        let id = table.create(TaskId::new(0, 0), 8, 0).unwrap();
        assert!(!table.take_interrupt_pending(id));
        table.mark_interrupt_pending(id).unwrap();
        assert!(table.take_interrupt_pending(id));
        assert!(!table.take_interrupt_pending(id));
    }

    #[test]
    fn stale_thread_id_after_reuse_is_rejected() {
        let table = ThreadTable::new();
        let id1 = table.create(TaskId::new(0, 0), 0, 0).unwrap();
        table.destroy(id1).unwrap();
        let id2 = table.create(TaskId::new(0, 0), 0, 0).unwrap();
        assert_ne!(id1.generation(), id2.generation());
        assert!(table.get(id1).is_none());
        assert!(table.get(id2).is_some());
    }
}
