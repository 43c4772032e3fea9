//! The non-cooperative, multi-CPU scheduler (spec.md §4.3).
//!
//! Grounded on the teacher's `scheduler/scheduler.rs`/`per_cpu.rs` for the
//! per-CPU run-queue-plus-"current" shape and `klog_debug!` tracing at
//! every state transition, and on `scheduler/load_balance.rs`/`work_steal.rs`
//! for the stealing policy (see [`crate::load_balance`]). The actual
//! register-level context switch (`scheduler/switch_asm.rs`,
//! `ffi_boundary.rs`, `trap.rs` in the teacher) is arch/boot territory this
//! workspace doesn't have; [`ContextSwitchHooks`] is the seam an external
//! collaborator fills in, the same pattern `mk-ipc::irq::PortIo` uses for
//! hardware access.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use mk_abi::error::{KError, KResult};
use mk_abi::task::{
    BlockReason, MAX_CPUS, NUM_PRIORITY_BANDS, PRIORITY_HIGHEST, PRIORITY_LOWEST, TaskId,
    ThreadId, ThreadState,
};
use mk_lib::{ParkOutcome, SchedulerHooks, ServiceCell, klog_debug, register_scheduler_hooks};

use crate::runqueue::RunQueue;
use crate::task::ThreadTable;

/// Per-band quantum, in timer ticks. Higher-numbered (lower-priority)
/// bands get a longer quantum: background work context-switches less
/// often, so interactive work in low-numbered bands gets CPU back sooner.
const fn quantum_for_band(band: u8) -> u32 {
    10 + (band as u32) * 2
}

/// What the scheduler needs from the arch/boot layer to actually suspend
/// and resume execution on a CPU. The real implementation lives outside
/// this workspace; tests exercise scheduler state transitions directly
/// without ever calling through this.
pub struct ContextSwitchHooks {
    /// Block the calling CPU until the thread it was running has left
    /// `Running` and a new one has been picked via [`Scheduler::pick_next`].
    pub yield_cpu: fn(),
}

static CONTEXT_SWITCH: ServiceCell<ContextSwitchHooks> = ServiceCell::new();

pub fn register_context_switch(hooks: &'static ContextSwitchHooks) {
    CONTEXT_SWITCH.register(hooks);
}

/// Owns every CPU's run queue plus the thread table. One instance per
/// kernel (`SCHEDULER`, below).
pub struct Scheduler {
    threads: ThreadTable,
    run_queues: [RunQueue; MAX_CPUS],
    /// Packed `(index << 32) | generation` of the thread currently
    /// running on each CPU, or `NO_CURRENT`.
    current: [AtomicU64; MAX_CPUS],
    quantum_remaining: [AtomicU32; MAX_CPUS],
}

const NO_CURRENT: u64 = u64::MAX;

fn pack_thread(id: ThreadId) -> u64 {
    ((id.index() as u64) << 32) | id.generation() as u64
}

fn unpack_thread(packed: u64) -> ThreadId {
    ThreadId::new((packed >> 32) as u32, packed as u32)
}

impl Scheduler {
    pub const fn new() -> Self {
        const RQ: RunQueue = RunQueue::new();
        const CUR: AtomicU64 = AtomicU64::new(NO_CURRENT);
        const QUANTUM: AtomicU32 = AtomicU32::new(0);
        Self {
            threads: ThreadTable::new(),
            run_queues: [RQ; MAX_CPUS],
            current: [CUR; MAX_CPUS],
            quantum_remaining: [QUANTUM; MAX_CPUS],
        }
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    /// Create a new thread for `task`, inheriting `band` from its creator
    /// (spec.md: "a new thread inherits its creating thread's band"), and
    /// place it Ready at the head of `home_cpu`'s run queue.
    pub fn spawn_thread(&self, task: TaskId, band: u8, home_cpu: usize) -> KResult<ThreadId> {
        let home_cpu = home_cpu.min(MAX_CPUS - 1);
        let id = self.threads.create(task, band, home_cpu as u32)?;
        self.threads.transition(id, ThreadState::Ready)?;
        if !self.run_queues[home_cpu].enqueue(id, band) {
            self.threads.destroy(id)?;
            return Err(KError::NoMem);
        }
        klog_debug!("sched: spawned thread {:?} band={} cpu={}", id, band, home_cpu);
        Ok(id)
    }

    /// Pick the next thread to run on `cpu`: highest-priority non-empty
    /// band, head position. Transitions it `Ready -> Running` and resets
    /// its quantum.
    pub fn pick_next(&self, cpu: usize) -> Option<ThreadId> {
        let cpu = cpu.min(MAX_CPUS - 1);
        let (id, band) = self.run_queues[cpu].pick_next()?;
        if self.threads.transition(id, ThreadState::Running).is_err() {
            // Stale/raced entry; drop it rather than propagate a thread
            // that no longer exists.
            return self.pick_next(cpu);
        }
        self.current[cpu].store(pack_thread(id), Ordering::Release);
        self.quantum_remaining[cpu].store(quantum_for_band(band), Ordering::Release);
        klog_debug!("sched: cpu {} now running {:?}", cpu, id);
        Some(id)
    }

    pub fn current_on(&self, cpu: usize) -> Option<ThreadId> {
        let cpu = cpu.min(MAX_CPUS - 1);
        let raw = self.current[cpu].load(Ordering::Acquire);
        if raw == NO_CURRENT {
            return None;
        }
        Some(unpack_thread(raw))
    }

    /// Timer tick for `cpu`'s current thread. Returns `true` if the
    /// quantum just ran out and the caller should preempt.
    pub fn on_quantum_tick(&self, cpu: usize) -> bool {
        let cpu = cpu.min(MAX_CPUS - 1);
        let prev = self.quantum_remaining[cpu].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |q| Some(q.saturating_sub(1)),
        );
        matches!(prev, Ok(1) | Ok(0))
    }

    /// Preempt `cpu`'s current thread: `Running -> Ready`, band decays one
    /// step (floor-limited at [`PRIORITY_LOWEST`]), re-enqueued at the
    /// head of its new band.
    pub fn preempt_current(&self, cpu: usize, id: ThreadId) -> KResult<()> {
        let cpu = cpu.min(MAX_CPUS - 1);
        self.threads.transition(id, ThreadState::Ready)?;
        let record = self.threads.get(id).ok_or(KError::NoEnt)?;
        let new_band = (record.band + 1).min(PRIORITY_LOWEST);
        self.threads.set_band(id, new_band)?;
        self.current[cpu].store(NO_CURRENT, Ordering::Release);
        if !self.run_queues[cpu].enqueue(id, new_band) {
            return Err(KError::NoMem);
        }
        klog_debug!("sched: cpu {} preempted {:?}, band -> {}", cpu, id, new_band);
        Ok(())
    }

    /// Voluntary sleep: `Running -> Sleeping`. Band is unchanged (spec.md:
    /// "band is unchanged on a voluntary sleep").
    pub fn block_current(&self, cpu: usize, id: ThreadId, reason: BlockReason) -> KResult<()> {
        self.threads.transition(id, ThreadState::Sleeping)?;
        self.threads.set_block_reason(id, reason)?;
        self.current[cpu.min(MAX_CPUS - 1)].store(NO_CURRENT, Ordering::Release);
        Ok(())
    }

    /// I/O wakeup: `Sleeping -> Ready`, band promotes one step
    /// (ceiling-limited at [`PRIORITY_HIGHEST`]), enqueued at the head of
    /// its home CPU's run queue for the new band.
    pub fn wake(&self, id: ThreadId) -> KResult<()> {
        let record = self.threads.get(id).ok_or(KError::NoEnt)?;
        if record.state != ThreadState::Sleeping {
            return Ok(());
        }
        let new_band = record.band.saturating_sub(1).max(PRIORITY_HIGHEST);
        self.threads.set_band(id, new_band)?;
        self.threads.transition(id, ThreadState::Ready)?;
        let cpu = (record.home_cpu as usize).min(MAX_CPUS - 1);
        if !self.run_queues[cpu].enqueue(id, new_band) {
            return Err(KError::NoMem);
        }
        klog_debug!("sched: woke {:?}, band -> {}", id, new_band);
        Ok(())
    }

    /// Cooperative cancellation (spec.md §4.3: "no preemptive kill").
    /// Marks the pending-interrupt flag; if the thread is currently
    /// `Sleeping`, unlinks it from whatever `WaitQueue` it is actually
    /// linked in — synchronously, from this call, rather than trusting
    /// the thread to unlink itself once resumed — and wakes it
    /// immediately so its blocking call observes `WakeReason::Interrupted`
    /// instead of waiting for a real event.
    ///
    /// The synchronous unlink matters: without it, the thread is `Ready`
    /// on the run queue but still present in its old `WaitQueue`'s waiter
    /// list until it happens to be scheduled. A real `wake_one` landing on
    /// that queue in the meantime would dequeue this stale entry — whose
    /// `hooks.wake` call is a silent no-op since it's no longer
    /// `Sleeping` — and the genuinely waiting thread behind it never gets
    /// woken.
    pub fn interrupt(&self, id: ThreadId) -> KResult<()> {
        let was_sleeping = self.threads.mark_interrupt_pending(id)?;
        if was_sleeping {
            self.threads.unlink_wait_queue(id)?;
            self.wake(id)?;
        }
        Ok(())
    }

    /// Timer-tick timeout sweep (spec.md §4.2/§8: a timed `sleep` fires
    /// `Timeout` at its deadline). Unlinks and wakes every `Sleeping`
    /// thread whose armed deadline has passed `now_ms`, same synchronous
    /// unlink-before-wake discipline as `interrupt`. Returns how many were
    /// woken.
    pub fn check_timeouts(&self, now_ms: u64) -> usize {
        let mut woken = 0usize;
        self.threads.for_each_expired_sleeper(now_ms, |id| {
            if self.threads.mark_timeout_pending(id).unwrap_or(false) {
                let _ = self.threads.unlink_wait_queue(id);
                if self.wake(id).is_ok() {
                    woken += 1;
                }
            }
        });
        if woken > 0 {
            klog_debug!("sched: {} thread(s) timed out", woken);
        }
        woken
    }

    pub fn run_queue(&self, cpu: usize) -> &RunQueue {
        &self.run_queues[cpu.min(MAX_CPUS - 1)]
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

static SCHEDULER: Scheduler = Scheduler::new();

pub fn scheduler() -> &'static Scheduler {
    &SCHEDULER
}

fn hook_current_thread() -> mk_abi::task::ThreadId {
    SCHEDULER
        .current_on(mk_lib::get_current_cpu())
        .unwrap_or(ThreadId::INVALID)
}

fn hook_park_current(timeout_ms: Option<u64>) -> ParkOutcome {
    let cpu = mk_lib::get_current_cpu();
    let id = SCHEDULER.current_on(cpu);
    if let Some(id) = id {
        // `WaitQueue::sleep` already linked `id` into its wait queue
        // (and, via `set_wait_queue_link`, into the TCB's link slot)
        // under its own lock before calling this hook; this is steps
        // (a)+(b) of the suspension discipline — mark Sleeping and arm
        // the timeout, if any.
        let _ = SCHEDULER.block_current(cpu, id, BlockReason::Other);
        if let Some(ms) = timeout_ms {
            let deadline = mk_lib::uptime_ms().saturating_add(ms);
            let _ = SCHEDULER.threads.set_sleep_deadline(id, Some(deadline));
        }
    }

    if let Some(backend) = CONTEXT_SWITCH.get() {
        (backend.yield_cpu)();
    }

    let Some(id) = id else {
        return ParkOutcome::Woken;
    };
    let _ = SCHEDULER.threads.set_sleep_deadline(id, None);
    if SCHEDULER.threads.take_interrupt_pending(id) {
        return ParkOutcome::Interrupted;
    }
    if SCHEDULER.threads.take_timeout_pending(id) {
        return ParkOutcome::TimedOut;
    }
    ParkOutcome::Woken
}

fn hook_wake(thread: mk_abi::task::ThreadId) {
    let _ = SCHEDULER.wake(thread);
}

fn hook_set_wait_queue_link(thread: mk_abi::task::ThreadId, queue: Option<&'static mk_lib::WaitQueue>) {
    let _ = SCHEDULER.threads.set_wait_queue_link(thread, queue);
}

static HOOKS: SchedulerHooks = SchedulerHooks {
    current_thread: hook_current_thread,
    park_current: hook_park_current,
    wake: hook_wake,
    set_wait_queue_link: hook_set_wait_queue_link,
};

/// Wire the scheduler into `mk-lib`'s `WaitQueue` (spec.md §8's
/// suspension discipline). Call once at boot.
pub fn init() {
    register_scheduler_hooks(&HOOKS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_places_thread_ready_on_its_home_cpu() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), 8, 0).unwrap();
        assert_eq!(sched.threads.get(id).unwrap().state, ThreadState::Ready);
        assert_eq!(sched.run_queue(0).len(), 1);
    }

    #[test]
    fn pick_next_transitions_to_running_and_sets_quantum() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), 3, 0).unwrap();
        let picked = sched.pick_next(0).unwrap();
        assert_eq!(picked, id);
        assert_eq!(sched.threads.get(id).unwrap().state, ThreadState::Running);
    }

    #[test]
    fn preemption_decays_band_and_requeues() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), 5, 0).unwrap();
        sched.pick_next(0).unwrap();
        sched.preempt_current(0, id).unwrap();
        assert_eq!(sched.threads.get(id).unwrap().band, 6);
        assert_eq!(sched.threads.get(id).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn preemption_band_decay_floors_at_lowest() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), PRIORITY_LOWEST, 0).unwrap();
        sched.pick_next(0).unwrap();
        sched.preempt_current(0, id).unwrap();
        assert_eq!(sched.threads.get(id).unwrap().band, PRIORITY_LOWEST);
    }

    #[test]
    fn wake_promotes_band_and_ceilings_at_highest() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), PRIORITY_HIGHEST, 0).unwrap();
        sched.pick_next(0).unwrap();
        sched.block_current(0, id, BlockReason::IpcWait).unwrap();
        sched.wake(id).unwrap();
        assert_eq!(sched.threads.get(id).unwrap().band, PRIORITY_HIGHEST);
        assert_eq!(sched.threads.get(id).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn voluntary_sleep_leaves_band_unchanged() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), 7, 0).unwrap();
        sched.pick_next(0).unwrap();
        sched.block_current(0, id, BlockReason::Sleep).unwrap();
        assert_eq!(sched.threads.get(id).unwrap().band, 7);
        assert_eq!(sched.threads.get(id).unwrap().state, ThreadState::Sleeping);
    }

    #[test]
    fn interrupt_on_sleeping_thread_wakes_it_with_pending_flag() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), 7, 0).unwrap();
        sched.pick_next(0).unwrap();
        sched.block_current(0, id, BlockReason::IpcWait).unwrap();
        sched.interrupt(id).unwrap();
        assert_eq!(sched.threads.get(id).unwrap().state, ThreadState::Ready);
        assert!(sched.threads.take_interrupt_pending(id));
    }

    #[test]
    fn quantum_tick_signals_preempt_at_zero() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), 0, 0).unwrap();
        sched.pick_next(0).unwrap();
        let quantum = quantum_for_band(0);
        let mut fired = false;
        for _ in 0..quantum {
            fired = sched.on_quantum_tick(0);
        }
        assert!(fired);
        let _ = id;
    }

    #[test]
    fn check_timeouts_ignores_unexpired_deadlines_and_wakes_expired_ones() {
        let sched = Scheduler::new();
        let id = sched.spawn_thread(TaskId::new(0, 0), 7, 0).unwrap();
        sched.pick_next(0).unwrap();
        sched.block_current(0, id, BlockReason::Sleep).unwrap();
        sched.threads.set_sleep_deadline(id, Some(100)).unwrap();

        assert_eq!(sched.check_timeouts(50), 0);
        assert_eq!(sched.threads.get(id).unwrap().state, ThreadState::Sleeping);

        assert_eq!(sched.check_timeouts(100), 1);
        assert_eq!(sched.threads.get(id).unwrap().state, ThreadState::Ready);
        assert!(sched.threads.take_timeout_pending(id));
    }

    /// Proves `check_timeouts` unlinks a timed-out thread from the *real*
    /// `WaitQueue` it is linked in (not just the thread table), the same
    /// property `interrupt_does_not_swallow_a_sibling_waiters_wake` proves
    /// for cooperative cancellation. The thread links into `WQ` through a
    /// genuine `sleep` call; the deadline is re-armed manually afterward
    /// since this single-threaded test harness has no real passage of
    /// time between linking and the timer tick that would notice it
    /// expired.
    #[test]
    fn check_timeouts_unlinks_the_thread_from_its_real_wait_queue() {
        init();
        static WQ: mk_lib::WaitQueue = mk_lib::WaitQueue::new();

        let id = SCHEDULER.spawn_thread(TaskId::new(2, 0), 7, 0).unwrap();
        SCHEDULER.pick_next(0).unwrap();
        WQ.sleep(None, mk_abi::SleepFlags::empty());
        assert_eq!(SCHEDULER.threads.get(id).unwrap().state, ThreadState::Sleeping);

        SCHEDULER.threads.set_sleep_deadline(id, Some(0)).unwrap();
        assert_eq!(SCHEDULER.check_timeouts(0), 1);

        assert_eq!(SCHEDULER.threads.get(id).unwrap().state, ThreadState::Ready);
        assert!(!WQ.has_waiters());
    }

    /// Regression test for a task-exit cascade's `interrupt()` swallowing
    /// a real producer's `wake_one` aimed at a different, genuinely
    /// waiting thread on the same queue.
    ///
    /// Uses the process-global scheduler (the hook functions are plain
    /// `fn`s wired to `SCHEDULER`, so a local `Scheduler` can't exercise
    /// them) with no context-switch backend registered, which makes
    /// `WaitQueue::sleep` return immediately without a real block — but
    /// the enqueue into the `WaitQueue` itself, which happens before that
    /// return, is real, so the thread ends up exactly as it would
    /// mid-block: `Sleeping` and linked.
    #[test]
    fn interrupt_does_not_swallow_a_sibling_waiters_wake() {
        init();
        static WQ: mk_lib::WaitQueue = mk_lib::WaitQueue::new();

        let victim = SCHEDULER.spawn_thread(TaskId::new(1, 0), 7, 0).unwrap();
        SCHEDULER.pick_next(0).unwrap();
        WQ.sleep(None, mk_abi::SleepFlags::empty());

        let survivor = SCHEDULER.spawn_thread(TaskId::new(1, 0), 7, 0).unwrap();
        SCHEDULER.pick_next(0).unwrap();
        WQ.sleep(None, mk_abi::SleepFlags::empty());

        SCHEDULER.interrupt(victim).unwrap();
        assert_eq!(SCHEDULER.threads.get(victim).unwrap().state, ThreadState::Ready);

        // A real producer's wake must reach `survivor`, not get spent on
        // `victim`'s stale, already-departed entry.
        assert!(WQ.wake_one());
        assert_eq!(SCHEDULER.threads.get(survivor).unwrap().state, ThreadState::Ready);
        assert!(!WQ.has_waiters());
    }
}
