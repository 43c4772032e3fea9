//! Address spaces and the page-fault path (spec.md §4.4).
//!
//! Grounded on the teacher's `mm/src/memory_init.rs` for the locking shape
//! (an `IrqRwLock`-protected table of objects, `klog_debug!` on every
//! region lifecycle event) and on `mm/src/process_vm.rs` for the
//! create/destroy/resize/fault operation names, re-pointed at the
//! `RegionTree`/`Backend`/`AsidPool` types built for this workspace.

use mk_abi::addr::VirtAddr;
use mk_abi::error::{KError, KResult};
use mk_abi::mm::{AccessFlags, Asid, MAX_ADDRESS_SPACES};
use mk_lib::{IrqRwLock, klog_debug};

use crate::asid::{AsidPool, ShootdownPolicy};
use crate::backend::Backend;
use crate::frame_alloc::FrameAllocator;
use crate::region::{Region, RegionTree};

/// One address space: an ASID plus its region table.
pub struct AddressSpace {
    asid: Asid,
    regions: IrqRwLock<RegionTree>,
}

impl AddressSpace {
    fn new(asid: Asid) -> Self {
        Self {
            asid,
            regions: IrqRwLock::new_named(RegionTree::new(), "as_regions"),
        }
    }

    pub fn asid(&self) -> Asid {
        self.asid
    }

    /// `as_area_create`: insert a new non-overlapping region.
    pub fn area_create(
        &self,
        base: VirtAddr,
        size: u64,
        flags: AccessFlags,
        backend: Backend,
    ) -> KResult<()> {
        let region = Region {
            base,
            size,
            flags,
            backend,
        };
        let mut regions = self.regions.write();
        regions.insert(region)?;
        klog_debug!(
            "as[{}]: area_create base={:#x} size={:#x}",
            self.asid.0,
            base.as_u64(),
            size
        );
        Ok(())
    }

    /// `as_area_destroy`: remove the region, freeing any frames the
    /// backend owns. `installed` is consulted for every page-aligned
    /// offset that was actually faulted in; callers that track installed
    /// PTEs elsewhere pass an empty slice when nothing was ever faulted.
    pub fn area_destroy(
        &self,
        base: VirtAddr,
        installed: &[(u64, mk_abi::addr::PhysAddr)],
        frames: &dyn FrameAllocator,
    ) -> KResult<()> {
        let mut regions = self.regions.write();
        let region = regions.remove(base)?;
        for &(offset, frame) in installed {
            let _ = offset;
            region.backend.frame_free(frame, frames);
        }
        klog_debug!("as[{}]: area_destroy base={:#x}", self.asid.0, base.as_u64());
        Ok(())
    }

    /// `as_area_resize`: grow (fails if it would overlap the next region)
    /// or shrink (the caller is responsible for unmapping/freeing the
    /// tail frames, passed in `freed_tail`) a region in place.
    pub fn area_resize(
        &self,
        base: VirtAddr,
        new_size: u64,
        freed_tail: &[(u64, mk_abi::addr::PhysAddr)],
        frames: &dyn FrameAllocator,
    ) -> KResult<()> {
        let mut regions = self.regions.write();
        let growing = {
            let region = regions.get_mut(base).ok_or(KError::NoEnt)?;
            new_size > region.size
        };
        if growing {
            let would_overlap = {
                let region = regions.get_mut(base).ok_or(KError::NoEnt)?;
                let candidate_end = region.base.as_u64() + new_size;
                let mut overlap = false;
                for other in regions.iter() {
                    if other.base == base {
                        continue;
                    }
                    if other.base.as_u64() < candidate_end && region.end() <= other.base.as_u64() {
                        // other starts before our new end and after (or at)
                        // our current end: growth would collide with it.
                        overlap = true;
                    }
                }
                overlap
            };
            if would_overlap {
                return Err(KError::AlreadyExists);
            }
        } else {
            let region = regions.get_mut(base).ok_or(KError::NoEnt)?;
            for &(offset, frame) in freed_tail {
                let _ = offset;
                region.backend.frame_free(frame, frames);
            }
        }
        let region = regions.get_mut(base).ok_or(KError::NoEnt)?;
        region.size = new_size;
        klog_debug!(
            "as[{}]: area_resize base={:#x} new_size={:#x}",
            self.asid.0,
            base.as_u64(),
            new_size
        );
        Ok(())
    }

    /// `as_page_fault`: locate the region containing `address`, check the
    /// requested access is allowed, and delegate to the backend for a
    /// frame. Returns the frame to install a PTE for.
    pub fn page_fault(
        &self,
        address: VirtAddr,
        access: mk_abi::mm::FaultAccess,
        frames: &dyn FrameAllocator,
    ) -> KResult<mk_abi::addr::PhysAddr> {
        let regions = self.regions.read();
        let region = regions.find(address).ok_or(KError::Fault)?;
        if !region.flags.contains(access.required_flag()) {
            return Err(KError::Fault);
        }
        let offset = region.offset_of(address).align_down_page();
        region
            .backend
            .page_fault(offset, access, frames)
            .ok_or(KError::NoMem)
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Snapshot a region's geometry and backend for `as_area_share`: the
    /// caller inserts the returned `(size, flags, backend.share())` into
    /// the target address space's own `area_create`.
    pub fn region_snapshot(&self, base: VirtAddr) -> KResult<(u64, AccessFlags, Backend)> {
        let regions = self.regions.read();
        let region = regions.find(base).filter(|r| r.base == base).ok_or(KError::NoEnt)?;
        Ok((region.size, region.flags, region.backend))
    }
}

trait AlignDownPage {
    fn align_down_page(self) -> u64;
}

impl AlignDownPage for u64 {
    fn align_down_page(self) -> u64 {
        self & !(mk_abi::PAGE_SIZE - 1)
    }
}

/// Owns every live address space plus the shared ASID pool (spec.md: "ASID
/// pool: guarded by an address-space-manager lock").
pub struct AddressSpaceManager {
    asids: AsidPool,
    slots: IrqRwLock<[Option<AddressSpace>; MAX_ADDRESS_SPACES]>,
}

impl AddressSpaceManager {
    pub fn new(asid_pool_capacity: usize) -> Self {
        const NONE: Option<AddressSpace> = None;
        Self {
            asids: AsidPool::new(asid_pool_capacity),
            slots: IrqRwLock::new_named([NONE; MAX_ADDRESS_SPACES], "as_manager"),
        }
    }

    pub fn asid_shootdown_policy(&self) -> ShootdownPolicy {
        self.asids.policy()
    }

    /// Live ASID count, for the debug/observability syscall band
    /// (spec.md §6).
    pub fn asid_in_use_count(&self) -> usize {
        self.asids.in_use_count()
    }

    /// `as_create`: allocate an ASID (evicting and shooting down a victim
    /// if the pool is exhausted) and a slot for the new address space.
    pub fn as_create(&self, shootdown: impl FnOnce(Asid, ShootdownPolicy)) -> KResult<Asid> {
        let asid = self.asids.alloc(shootdown);
        let mut slots = self.slots.write();
        let idx = asid.0 as usize;
        if idx >= slots.len() {
            self.asids.free(asid);
            return Err(KError::Overflow);
        }
        slots[idx] = Some(AddressSpace::new(asid));
        klog_debug!("as_manager: created asid={}", asid.0);
        Ok(asid)
    }

    /// Release an address space and return its ASID to the pool.
    pub fn as_destroy(&self, asid: Asid) -> KResult<()> {
        let mut slots = self.slots.write();
        let idx = asid.0 as usize;
        let slot = slots.get_mut(idx).ok_or(KError::NoEnt)?;
        if slot.take().is_none() {
            return Err(KError::NoEnt);
        }
        drop(slots);
        self.asids.free(asid);
        klog_debug!("as_manager: destroyed asid={}", asid.0);
        Ok(())
    }

    pub fn with_address_space<R>(&self, asid: Asid, f: impl FnOnce(&AddressSpace) -> R) -> KResult<R> {
        let slots = self.slots.read();
        let slot = slots.get(asid.0 as usize).ok_or(KError::NoEnt)?;
        slot.as_ref().map(f).ok_or(KError::NoEnt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BumpFrameAllocator;

    #[test]
    fn area_create_rejects_overlap() {
        let space = AddressSpace::new(Asid(1));
        space
            .area_create(VirtAddr::new(0x1000), 0x1000, AccessFlags::READ, Backend::Anonymous)
            .unwrap();
        let err = space
            .area_create(VirtAddr::new(0x1800), 0x1000, AccessFlags::READ, Backend::Anonymous)
            .unwrap_err();
        assert_eq!(err, KError::AlreadyExists);
    }

    #[test]
    fn fault_on_unmapped_address_is_fault() {
        let space = AddressSpace::new(Asid(1));
        let frames = BumpFrameAllocator::new(0x10_0000, 4);
        let err = space
            .page_fault(VirtAddr::new(0x9000), mk_abi::mm::FaultAccess::Read, &frames)
            .unwrap_err();
        assert_eq!(err, KError::Fault);
    }

    #[test]
    fn fault_with_disallowed_access_is_fault() {
        let space = AddressSpace::new(Asid(1));
        let frames = BumpFrameAllocator::new(0x10_0000, 4);
        space
            .area_create(VirtAddr::new(0x1000), 0x1000, AccessFlags::READ, Backend::Anonymous)
            .unwrap();
        let err = space
            .page_fault(VirtAddr::new(0x1000), mk_abi::mm::FaultAccess::Write, &frames)
            .unwrap_err();
        assert_eq!(err, KError::Fault);
    }

    #[test]
    fn fault_on_allowed_anonymous_region_allocates_a_frame() {
        let space = AddressSpace::new(Asid(1));
        let frames = BumpFrameAllocator::new(0x10_0000, 4);
        space
            .area_create(
                VirtAddr::new(0x1000),
                0x1000,
                AccessFlags::READ | AccessFlags::WRITE,
                Backend::Anonymous,
            )
            .unwrap();
        let frame = space
            .page_fault(VirtAddr::new(0x1050), mk_abi::mm::FaultAccess::Write, &frames)
            .unwrap();
        assert!(!frame.is_null());
    }

    #[test]
    fn create_destroy_round_trips_region_count() {
        let space = AddressSpace::new(Asid(1));
        space
            .area_create(VirtAddr::new(0x1000), 0x1000, AccessFlags::READ, Backend::Anonymous)
            .unwrap();
        assert_eq!(space.region_count(), 1);
        let frames = BumpFrameAllocator::new(0, 0);
        space.area_destroy(VirtAddr::new(0x1000), &[], &frames).unwrap();
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn region_snapshot_reports_geometry_and_backend() {
        let space = AddressSpace::new(Asid(1));
        space
            .area_create(VirtAddr::new(0x1000), 0x2000, AccessFlags::READ, Backend::Anonymous)
            .unwrap();
        let (size, flags, backend) = space.region_snapshot(VirtAddr::new(0x1000)).unwrap();
        assert_eq!(size, 0x2000);
        assert_eq!(flags, AccessFlags::READ);
        assert_eq!(backend, Backend::Anonymous);
    }

    #[test]
    fn region_snapshot_of_unmapped_base_is_noent() {
        let space = AddressSpace::new(Asid(1));
        let err = space.region_snapshot(VirtAddr::new(0x9000)).unwrap_err();
        assert_eq!(err, KError::NoEnt);
    }

    #[test]
    fn manager_reports_asid_in_use_count() {
        let manager = AddressSpaceManager::new(4);
        assert_eq!(manager.asid_in_use_count(), 0);
        manager.as_create(|_, _| panic!("no eviction expected")).unwrap();
        assert_eq!(manager.asid_in_use_count(), 1);
    }

    #[test]
    fn manager_create_destroy_round_trips_asid() {
        let manager = AddressSpaceManager::new(64);
        let asid = manager.as_create(|_, _| panic!("no eviction expected")).unwrap();
        let count = manager.with_address_space(asid, |space| space.region_count()).unwrap();
        assert_eq!(count, 0);
        manager.as_destroy(asid).unwrap();
        assert!(manager.with_address_space(asid, |space| space.region_count()).is_err());
    }
}
