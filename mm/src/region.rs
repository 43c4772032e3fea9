//! Region storage for one address space (spec.md §4.4).
//!
//! The teacher keeps VMAs in a hand-rolled, pointer-linked red-black tree
//! (`mm/src/vma_tree.rs`) so it can run without an allocator this early in
//! boot. This workspace has no such boot constraint and spec.md §9 prefers
//! a typed container over a raw-pointer graph for exactly this kind of
//! structure, so regions live in a plain `BTreeMap<VirtAddr, Region>` keyed
//! by base address: `O(log n)` base lookup, and `range()` gives an
//! ordered walk for overlap checks without hand-rolled tree rotations.

use alloc::collections::BTreeMap;

use mk_abi::addr::VirtAddr;
use mk_abi::error::{KError, KResult};
use mk_abi::mm::AccessFlags;

use crate::backend::Backend;

/// One mapped range `[base, base + size)` within an address space.
#[derive(Clone, Debug)]
pub struct Region {
    pub base: VirtAddr,
    pub size: u64,
    pub flags: AccessFlags,
    pub backend: Backend,
}

impl Region {
    #[inline]
    pub fn end(&self) -> u64 {
        self.base.as_u64() + self.size
    }

    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        let a = addr.as_u64();
        a >= self.base.as_u64() && a < self.end()
    }

    #[inline]
    pub fn offset_of(&self, addr: VirtAddr) -> u64 {
        addr.as_u64() - self.base.as_u64()
    }
}

/// The ordered set of regions belonging to one address space.
#[derive(Default)]
pub struct RegionTree {
    regions: BTreeMap<VirtAddr, Region>,
}

impl RegionTree {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Insert a region spanning `[base, base + size)`. Fails with
    /// `AlreadyExists` if it overlaps any existing region (spec.md §4.4:
    /// "creating a region that overlaps an existing one... fails").
    pub fn insert(&mut self, region: Region) -> KResult<()> {
        if self.overlaps(region.base, region.size) {
            return Err(KError::AlreadyExists);
        }
        self.regions.insert(region.base, region);
        Ok(())
    }

    /// Remove the region whose base is exactly `base`.
    pub fn remove(&mut self, base: VirtAddr) -> KResult<Region> {
        self.regions.remove(&base).ok_or(KError::NoEnt)
    }

    /// Find the region (if any) containing `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    pub fn find_mut(&mut self, addr: VirtAddr) -> Option<&mut Region> {
        let base = self
            .regions
            .range(..=addr)
            .next_back()
            .map(|(base, r)| (*base, r.contains(addr)));
        match base {
            Some((base, true)) => self.regions.get_mut(&base),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, base: VirtAddr) -> Option<&mut Region> {
        self.regions.get_mut(&base)
    }

    /// Whether `[base, base + size)` overlaps any region currently stored.
    pub fn overlaps(&self, base: VirtAddr, size: u64) -> bool {
        let end = base.as_u64() + size;
        // Candidate before `base` might still extend past it; the rest
        // start at or after `base` and only need an end-of-range check.
        if let Some((_, before)) = self.regions.range(..=base).next_back() {
            if before.end() > base.as_u64() {
                return true;
            }
        }
        self.regions
            .range(base..)
            .next()
            .map(|(start, _)| start.as_u64() < end)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, size: u64) -> Region {
        Region {
            base: VirtAddr::new(base),
            size,
            flags: AccessFlags::READ | AccessFlags::WRITE,
            backend: Backend::Anonymous,
        }
    }

    #[test]
    fn non_overlapping_inserts_succeed() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x1000, 0x1000)).unwrap();
        tree.insert(region(0x2000, 0x1000)).unwrap();
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x1000, 0x2000)).unwrap();
        let err = tree.insert(region(0x1800, 0x1000)).unwrap_err();
        assert_eq!(err, KError::AlreadyExists);
    }

    #[test]
    fn find_locates_containing_region() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x1000, 0x1000)).unwrap();
        assert!(tree.find(VirtAddr::new(0x1500)).is_some());
        assert!(tree.find(VirtAddr::new(0x2500)).is_none());
    }

    #[test]
    fn remove_then_reinsert_at_same_base_round_trips() {
        let mut tree = RegionTree::new();
        tree.insert(region(0x1000, 0x1000)).unwrap();
        tree.remove(VirtAddr::new(0x1000)).unwrap();
        assert!(tree.is_empty());
        tree.insert(region(0x1000, 0x1000)).unwrap();
        assert_eq!(tree.len(), 1);
    }
}
