//! Physical frame allocation facade.
//!
//! The teacher's buddy allocator with per-CPU page caches
//! (`mm/src/page_alloc.rs`) is boot-layer territory: it needs a memory map
//! handed down by the bootloader, which this workspace doesn't have. What
//! the address-space manager actually needs from it is a narrow interface
//! — hand me a zeroed frame, take one back — so that's what's kept, as a
//! trait an external collaborator implements, plus a deterministic bump
//! allocator double for tests.

use mk_abi::addr::PhysAddr;

/// What [`crate::address_space`] needs from a physical frame allocator.
/// The boot layer's buddy allocator (out of scope here) is the real
/// implementation; tests use [`BumpFrameAllocator`].
pub trait FrameAllocator: Send + Sync {
    /// Allocate one zeroed physical page frame, or `None` if exhausted.
    fn alloc_frame(&self) -> Option<PhysAddr>;

    /// Return a frame previously returned by `alloc_frame`.
    fn free_frame(&self, frame: PhysAddr);
}

/// A deterministic, never-frees frame allocator for unit tests: hands out
/// successive page-aligned addresses from a fixed pool starting at
/// `base`. Freed frames are not reused, which is fine for tests that only
/// check frame *distinctness*, not exhaustion-and-reuse behavior.
pub struct BumpFrameAllocator {
    limit: u64,
    next: core::sync::atomic::AtomicU64,
}

impl BumpFrameAllocator {
    pub const fn new(base: u64, frame_count: u64) -> Self {
        Self {
            limit: base + frame_count * mk_abi::PAGE_SIZE,
            next: core::sync::atomic::AtomicU64::new(base),
        }
    }
}

impl FrameAllocator for BumpFrameAllocator {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        use core::sync::atomic::Ordering;
        let mut cur = self.next.load(Ordering::Relaxed);
        loop {
            if cur >= self.limit {
                return None;
            }
            let next = cur + mk_abi::PAGE_SIZE;
            match self
                .next
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(PhysAddr::new(cur)),
                Err(observed) => cur = observed,
            }
        }
    }

    fn free_frame(&self, _frame: PhysAddr) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocator_hands_out_distinct_frames() {
        let alloc = BumpFrameAllocator::new(0x10_0000, 4);
        let a = alloc.alloc_frame().unwrap();
        let b = alloc.alloc_frame().unwrap();
        assert_ne!(a, b);
        assert_eq!(b.as_u64() - a.as_u64(), mk_abi::PAGE_SIZE);
    }

    #[test]
    fn bump_allocator_exhausts_pool() {
        let alloc = BumpFrameAllocator::new(0, 2);
        assert!(alloc.alloc_frame().is_some());
        assert!(alloc.alloc_frame().is_some());
        assert!(alloc.alloc_frame().is_none());
    }
}
