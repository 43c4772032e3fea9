//! Address-space ABI types shared between `mk-mm`, `mk-core` (a task owns
//! an address-space handle) and the syscall dispatch table.

use crate::define_handle;
use crate::task::MAX_TASKS;

define_handle!(AsHandle);

/// Address-space identifier. ASID 0 is reserved for the kernel (spec.md
/// §3/§4.4); userspace values are drawn from a bounded, recyclable pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asid(pub u16);

impl Asid {
    pub const KERNEL: Self = Self(0);

    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 == 0
    }
}

bitflags::bitflags! {
    /// Region access flags (spec.md §3: "{read, write, exec, cacheable}").
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AccessFlags: u8 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const EXEC      = 1 << 2;
        const CACHEABLE = 1 << 3;
    }
}

/// The access an offending instruction attempted, passed to
/// `as_page_fault` (spec.md §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Exec,
}

impl FaultAccess {
    /// The single [`AccessFlags`] bit this access requires the region to
    /// grant.
    #[inline]
    pub const fn required_flag(self) -> AccessFlags {
        match self {
            FaultAccess::Read => AccessFlags::READ,
            FaultAccess::Write => AccessFlags::WRITE,
            FaultAccess::Exec => AccessFlags::EXEC,
        }
    }
}

pub const MAX_ADDRESS_SPACES: usize = MAX_TASKS;
pub const MAX_REGIONS_PER_SPACE: usize = 128;
