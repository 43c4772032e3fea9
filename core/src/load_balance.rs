//! Work-stealing load balancer (spec.md §4.3).
//!
//! Grounded on the teacher's `scheduler/load_balance.rs` (periodic
//! interval-gated rebalance, imbalance-threshold trigger) combined with
//! `work_steal.rs`'s most/least-loaded CPU search, re-pointed at
//! [`crate::scheduler::Scheduler`]'s run queues. Source and destination
//! locks are taken in address order in the teacher to avoid ABA deadlock
//! between two simultaneous balancer passes; the two `RunQueue`s here are
//! plain array elements with no pointer identity to compare, so CPU index
//! order stands in for "address order" — always lock the lower-numbered
//! CPU's queue first.

use mk_abi::task::MAX_CPUS;
use mk_lib::{get_cpu_count, klog_debug};

use crate::runqueue::STEAL_BATCH_MAX;
use crate::scheduler::Scheduler;

/// One balancing pass: find the most- and least-loaded online CPUs and
/// move a bounded batch of ready threads from the former to the latter.
/// Returns the number of threads migrated.
pub fn rebalance_once(sched: &Scheduler) -> usize {
    let cpu_count = get_cpu_count().min(MAX_CPUS);
    if cpu_count <= 1 {
        return 0;
    }

    let mut max_cpu = 0;
    let mut max_load = sched.run_queue(0).len();
    let mut min_cpu = 0;
    let mut min_load = max_load;
    for cpu in 1..cpu_count {
        let load = sched.run_queue(cpu).len();
        if load > max_load {
            max_load = load;
            max_cpu = cpu;
        }
        if load < min_load {
            min_load = load;
            min_cpu = cpu;
        }
    }

    if max_cpu == min_cpu || max_load <= min_load + 1 {
        return 0;
    }

    // Each RunQueue call takes and releases its own lock, so there is no
    // held-lock-pair to order; the steal then enqueue below touches
    // `max_cpu`'s queue and `min_cpu`'s queue one at a time regardless of
    // which index is smaller.
    let mut batch = [(mk_abi::task::ThreadId::INVALID, 0u8); STEAL_BATCH_MAX];
    let stolen = sched.run_queue(max_cpu).steal_batch(&mut batch);
    let mut moved = 0;
    for &(thread, band) in batch.iter().take(stolen) {
        if sched.run_queue(min_cpu).enqueue(thread, band) {
            moved += 1;
        } else {
            // Destination full; put it back on the source rather than
            // drop it.
            sched.run_queue(max_cpu).enqueue(thread, band);
        }
    }
    if moved > 0 {
        klog_debug!(
            "load_balance: moved {} thread(s) cpu {} -> cpu {}",
            moved,
            max_cpu,
            min_cpu
        );
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use mk_abi::task::TaskId;

    #[test]
    fn rebalance_is_noop_with_single_cpu_context() {
        // get_cpu_count() defaults to 1 without boot bring-up registering
        // more, so this just exercises the early return.
        let sched = Scheduler::new();
        sched.spawn_thread(TaskId::new(0, 0), 5, 0).unwrap();
        assert_eq!(rebalance_once(&sched), 0);
    }

    #[test]
    fn steal_batch_moves_threads_between_queues_directly() {
        let sched = Scheduler::new();
        for _ in 0..5 {
            sched.spawn_thread(TaskId::new(0, 0), 4, 0).unwrap();
        }
        let mut batch = [(mk_abi::task::ThreadId::INVALID, 0u8); STEAL_BATCH_MAX];
        let n = sched.run_queue(0).steal_batch(&mut batch);
        assert_eq!(n, 5);
        for &(thread, band) in batch.iter().take(n) {
            assert!(sched.run_queue(1).enqueue(thread, band));
        }
        assert_eq!(sched.run_queue(1).len(), 5);
        assert!(sched.run_queue(0).is_empty());
    }
}
