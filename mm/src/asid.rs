//! ASID allocation and recycling (spec.md §4.4).
//!
//! ASID 0 is reserved for the kernel. Userspace ASIDs are drawn from a
//! bounded pool; when the pool is exhausted, allocation evicts the
//! least-recently-used in-use ASID and invalidates its TLB entries
//! cluster-wide before handing it to the new owner.
//!
//! Invalidation policy (spec.md §4.4): pools of ≤ 64 ASIDs recycle via a
//! broadcast shootdown (every peer CPU is IPI'd); pools of ≥ 256 recycle
//! lazily (the stale mapping is left alone until the next context switch
//! on that CPU notices the generation mismatch). `KernelConfig` picks the
//! pool size; 256 is the reference default (lazy regime), with a 64-entry
//! override exercised in tests to cover the broadcast path.

use mk_abi::Asid;
use mk_lib::{IrqMutex, klog_warn};

/// How a recycled ASID's stale TLB entries get invalidated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShootdownPolicy {
    /// IPI every peer CPU immediately (small pools, spec.md: "≤ 64").
    Broadcast,
    /// Leave stale entries; the next switch on a stale CPU notices the
    /// generation bump and reloads (large pools, spec.md: "≥ 256").
    Lazy,
}

struct Slot {
    in_use: bool,
    /// Bumped every time this slot is recycled; a peer CPU compares this
    /// against the generation it last switched to for the lazy policy.
    generation: u32,
}

struct AsidPoolInner {
    slots: [Slot; AsidPool::MAX_CAPACITY],
    capacity: usize,
    /// Ring cursor for "evict the next victim in round-robin order"; a
    /// simple stand-in for a true LRU clock without per-slot timestamps.
    clock_hand: usize,
}

/// A bounded, recyclable pool of non-kernel ASIDs.
pub struct AsidPool {
    inner: IrqMutex<AsidPoolInner>,
    policy: ShootdownPolicy,
}

impl AsidPool {
    pub const MAX_CAPACITY: usize = 256;

    /// `capacity` ASIDs numbered 1..=capacity (ASID 0 is the kernel's).
    /// Panics if `capacity` exceeds [`Self::MAX_CAPACITY`].
    pub const fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= Self::MAX_CAPACITY);
        const EMPTY: Slot = Slot {
            in_use: false,
            generation: 0,
        };
        Self {
            inner: IrqMutex::new_named(
                AsidPoolInner {
                    slots: [EMPTY; Self::MAX_CAPACITY],
                    capacity,
                    clock_hand: 0,
                },
                "asid_pool",
            ),
            policy: if capacity <= 64 {
                ShootdownPolicy::Broadcast
            } else {
                ShootdownPolicy::Lazy
            },
        }
    }

    pub fn policy(&self) -> ShootdownPolicy {
        self.policy
    }

    /// Allocate an ASID, evicting a victim and invalidating its TLB
    /// entries (per `policy()`) if the pool is full.
    pub fn alloc(&self, shootdown: impl FnOnce(Asid, ShootdownPolicy)) -> Asid {
        let mut inner = self.inner.lock();
        for i in 0..inner.capacity {
            if !inner.slots[i].in_use {
                inner.slots[i].in_use = true;
                return Asid((i + 1) as u16);
            }
        }

        klog_warn!("asid pool exhausted, evicting a victim");
        let capacity = inner.capacity;
        let victim = inner.clock_hand % capacity;
        inner.clock_hand = (inner.clock_hand + 1) % capacity;
        inner.slots[victim].generation = inner.slots[victim].generation.wrapping_add(1);
        let victim_asid = Asid((victim + 1) as u16);
        drop(inner);

        shootdown(victim_asid, self.policy);
        victim_asid
    }

    /// Return `asid` to the free pool. No-op for `Asid::KERNEL`.
    pub fn free(&self, asid: Asid) {
        if asid.is_kernel() {
            return;
        }
        let idx = asid.0 as usize - 1;
        let mut inner = self.inner.lock();
        if idx < inner.capacity {
            inner.slots[idx].in_use = false;
        }
    }

    pub fn generation_of(&self, asid: Asid) -> u32 {
        if asid.is_kernel() {
            return 0;
        }
        let idx = asid.0 as usize - 1;
        let inner = self.inner.lock();
        if idx < inner.capacity {
            inner.slots[idx].generation
        } else {
            0
        }
    }

    pub fn in_use_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots[..inner.capacity]
            .iter()
            .filter(|s| s.in_use)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn small_pool_uses_broadcast_policy() {
        let pool = AsidPool::new(64);
        assert_eq!(pool.policy(), ShootdownPolicy::Broadcast);
    }

    #[test]
    fn large_pool_uses_lazy_policy() {
        let pool = AsidPool::new(256);
        assert_eq!(pool.policy(), ShootdownPolicy::Lazy);
    }

    #[test]
    fn allocations_are_distinct_until_exhausted() {
        let pool = AsidPool::new(4);
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..4 {
            seen.push(pool.alloc(|_, _| panic!("should not evict yet")));
        }
        seen.sort_by_key(|a| a.0);
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn exhaustion_evicts_and_shoots_down() {
        let pool = AsidPool::new(2);
        pool.alloc(|_, _| panic!("no eviction on first fill"));
        pool.alloc(|_, _| panic!("no eviction on first fill"));

        let shot_down = AtomicUsize::new(0);
        let victim = pool.alloc(|_, policy| {
            assert_eq!(policy, ShootdownPolicy::Broadcast);
            shot_down.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(shot_down.load(Ordering::Relaxed), 1);
        assert!(victim.0 == 1 || victim.0 == 2);
    }

    #[test]
    fn freeing_kernel_asid_is_a_no_op() {
        let pool = AsidPool::new(4);
        pool.free(Asid::KERNEL);
        assert_eq!(pool.in_use_count(), 0);
    }
}
