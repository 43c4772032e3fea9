//! External collaborator seams: what the trap-dispatch table needs from
//! the architecture layer, which does not exist in this workspace (no
//! boot entry point, no real MMU driver). Grounded on the same pattern
//! `mk-mm::FrameAllocator` and `mk-ipc::irq::PortIo` already use — a
//! narrow trait an arch/boot crate implements for real, a test double
//! standing in here.

use mk_abi::addr::{PhysAddr, VirtAddr};
use mk_abi::error::KResult;
use mk_abi::ipc::IpcPayload;
use mk_abi::mm::{AccessFlags, Asid, FaultAccess};

use crate::trap::TrapVector;

/// One trapped CPU state, already normalized by the arch entry stub
/// (spec.md §6: "the entry stub normalizes the trapped state into a
/// uniform interrupt-state record... and dispatches by vector"). Only the
/// fields the dispatch table actually reads or writes are exposed; saved
/// general-purpose registers and mode flags stay arch-private.
pub trait TrapFrame {
    fn vector(&self) -> TrapVector;
    /// Syscall number (vector == `Syscall` only).
    fn syscall_number(&self) -> u64;
    /// The `index`-th of up to six machine-word syscall arguments.
    fn arg(&self, index: usize) -> u64;
    /// Write the value returned to userspace.
    fn set_return(&mut self, value: i64);
    /// Faulting address (vector == `PageFault` only).
    fn fault_address(&self) -> VirtAddr;
    /// The access the faulting instruction attempted.
    fn fault_access(&self) -> FaultAccess;
    /// The ASID of the address space that faulted (vector == `PageFault`
    /// only). On real hardware this comes from the register the MMU
    /// tags the fault with (e.g. CR3 on x86_64), not from anything
    /// `mk-mm` tracks.
    fn faulting_asid(&self) -> Asid;
}

/// `mk_mm::AddressSpace::page_fault` only resolves which physical frame
/// backs a faulting address; writing the page-table entry (and
/// invalidating the TLB for it) needs the real MMU format, which is
/// architecture-specific.
pub trait PageTableWriter {
    fn install(&self, asid: Asid, virt: VirtAddr, phys: PhysAddr, flags: AccessFlags);
}

/// Copies fixed-size word buffers to and from user-space memory. Needed
/// anywhere a syscall's payload doesn't fit the six-machine-word
/// register budget (an `IpcPayload` alone is six words: method plus five
/// arguments), the same reason real syscall ABIs pass a pointer instead
/// of inlining a large struct across registers. Validating the pointer
/// against the caller's address space is the arch layer's job; this
/// trait only names the operation the dispatch table needs.
pub trait UserCopy {
    fn read_words(&self, user_ptr: u64, out: &mut [u64]) -> KResult<()>;
    fn write_words(&self, user_ptr: u64, data: &[u64]) -> KResult<()>;
}

/// Read a fixed-width [`IpcPayload`] (method + five arguments) out of
/// user memory at `user_ptr`.
pub fn read_payload(user_copy: &dyn UserCopy, user_ptr: u64) -> KResult<IpcPayload> {
    let mut words = [0u64; 6];
    user_copy.read_words(user_ptr, &mut words)?;
    Ok(IpcPayload::new(words[0], [words[1], words[2], words[3], words[4], words[5]]))
}

/// Write a fixed-width [`IpcPayload`] back to user memory at `user_ptr`.
pub fn write_payload(user_copy: &dyn UserCopy, user_ptr: u64, payload: IpcPayload) -> KResult<()> {
    let words = [
        payload.method,
        payload.args[0],
        payload.args[1],
        payload.args[2],
        payload.args[3],
        payload.args[4],
    ];
    user_copy.write_words(user_ptr, &words)
}
