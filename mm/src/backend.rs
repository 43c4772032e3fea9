//! Region backends (spec.md §4.4): "the backend set... is closed; adding a
//! backend is a code change, not configuration." Modeled on the teacher's
//! preference for sum types over trait objects (`mm/src/cow.rs`,
//! `mm/src/demand.rs`): one `enum Backend` with inherent methods rather
//! than a `dyn Backend` vtable.

use mk_abi::addr::PhysAddr;
use mk_abi::mm::FaultAccess;
use mk_lib::klog_debug;

use crate::frame_alloc::FrameAllocator;

/// Per-backend private data bag (spec.md §3: "a per-backend private data
/// bag"), carried inline in [`Backend`] rather than type-erased.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Demand-paged, zero-filled on first touch.
    Anonymous,
    /// Backed by an ELF image: copy-on-read until written, then
    /// copy-on-write (private, per-mapper copy from then on).
    ElfImage {
        image_base: PhysAddr,
        image_len: u64,
    },
    /// A fixed mapping directly onto physical memory (MMIO, device
    /// buffers); never demand-paged, never freed by the manager.
    RawPhysical { phys_base: PhysAddr },
    /// Shared between address spaces; `share()` hands back an identical
    /// `Backend` value so every mapper's region points at the same
    /// backing frames (spec.md: "region ↔ address space ↔ backend").
    Shared { phys_base: PhysAddr },
}

impl Backend {
    /// Resolve a fault at `offset` bytes into the region. Returns the
    /// physical frame to install, allocating and filling it as needed.
    pub fn page_fault(
        &self,
        offset: u64,
        access: FaultAccess,
        frames: &dyn FrameAllocator,
    ) -> Option<PhysAddr> {
        match self {
            Backend::Anonymous => {
                let frame = frames.alloc_frame()?;
                klog_debug!("backend: anon fault at offset {:#x} -> {:#x}", offset, frame.as_u64());
                Some(frame)
            }
            Backend::ElfImage {
                image_base,
                image_len,
            } => {
                if offset < *image_len {
                    // Image pages start shared (copy-on-read); a write
                    // fault is handled by the caller re-resolving through
                    // a private copy once it observes `access == Write`
                    // against a still-shared frame (the manager owns that
                    // promotion, not the backend).
                    let _ = access;
                    Some(image_base.offset(offset.min(*image_len - 1) & !(mk_abi::PAGE_SIZE - 1)))
                } else {
                    // Past the file's extent: zero-fill (BSS tail).
                    frames.alloc_frame()
                }
            }
            Backend::RawPhysical { phys_base } => Some(phys_base.offset(offset)),
            Backend::Shared { phys_base } => Some(phys_base.offset(offset)),
        }
    }

    /// Release a frame previously handed out by `page_fault` for this
    /// region. Raw-physical and shared mappings never own their frames,
    /// so freeing is a no-op for them.
    pub fn frame_free(&self, frame: PhysAddr, frames: &dyn FrameAllocator) {
        match self {
            Backend::Anonymous => frames.free_frame(frame),
            Backend::ElfImage { .. } => {
                // Only private (copy-on-write) copies are owned by this
                // mapping; the shared image pages are not.
                frames.free_frame(frame);
            }
            Backend::RawPhysical { .. } | Backend::Shared { .. } => {}
        }
    }

    /// Produce the backend value a second mapper's region should carry
    /// after this region is shared (fork, explicit share syscall).
    pub fn share(&self) -> Backend {
        match self {
            Backend::Anonymous => Backend::Anonymous,
            Backend::ElfImage {
                image_base,
                image_len,
            } => Backend::ElfImage {
                image_base: *image_base,
                image_len: *image_len,
            },
            Backend::RawPhysical { phys_base } => Backend::RawPhysical {
                phys_base: *phys_base,
            },
            Backend::Shared { phys_base } => Backend::Shared {
                phys_base: *phys_base,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BumpFrameAllocator;

    #[test]
    fn anonymous_fault_allocates_a_frame() {
        let frames = BumpFrameAllocator::new(0x20_0000, 4);
        let backend = Backend::Anonymous;
        let frame = backend.page_fault(0, FaultAccess::Read, &frames);
        assert!(frame.is_some());
    }

    #[test]
    fn raw_physical_never_allocates() {
        let frames = BumpFrameAllocator::new(0, 0);
        let backend = Backend::RawPhysical {
            phys_base: PhysAddr::new(0xB800_0000),
        };
        let frame = backend.page_fault(0x1000, FaultAccess::Write, &frames);
        assert_eq!(frame, Some(PhysAddr::new(0xB800_1000)));
    }
}
