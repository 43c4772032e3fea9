//! Diagnostic dump helpers for trap frames and raw memory.
//!
//! The register-snapshot/stack-trace side of the teacher's `kdiag` lived on
//! `cpu::read_cr*`/`stacktrace`, both boot/arch-layer facilities this
//! workspace doesn't carry. What's left is the part that only needs the
//! trap frame itself: naming an exception vector and dumping it or raw
//! bytes through [`crate::klog`].

use core::ffi::c_int;

#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub fn exception_name(vector: u8) -> &'static str {
    match vector {
        0 => "Divide Error",
        1 => "Debug",
        2 => "NMI",
        3 => "Breakpoint",
        4 => "Overflow",
        5 => "Bound Range",
        6 => "Invalid Opcode",
        7 => "Device Not Available",
        8 => "Double Fault",
        10 => "Invalid TSS",
        11 => "Segment Not Present",
        12 => "Stack Fault",
        13 => "General Protection",
        14 => "Page Fault",
        16 => "FPU Error",
        17 => "Alignment Check",
        18 => "Machine Check",
        19 => "SIMD FP Exception",
        _ => "Unknown",
    }
}

pub fn kdiag_dump_interrupt_frame(frame: *const InterruptFrame) {
    if frame.is_null() {
        return;
    }
    unsafe {
        let f = &*frame;
        let exc_name = exception_name(f.vector as u8);
        crate::klog_info!("=== INTERRUPT FRAME DUMP ===");
        crate::klog_info!(
            "Vector: {} ({}) Error Code: 0x{:x}",
            f.vector,
            exc_name,
            f.error_code
        );
        crate::klog_info!(
            "RIP: 0x{:x}  CS: 0x{:x}  RFLAGS: 0x{:x}",
            f.rip,
            f.cs,
            f.rflags
        );
        crate::klog_info!("RSP: 0x{:x}  SS: 0x{:x}", f.rsp, f.ss);
        crate::klog_info!("RAX: 0x{:x}  RBX: 0x{:x}  RCX: 0x{:x}", f.rax, f.rbx, f.rcx);
        crate::klog_info!("RDX: 0x{:x}  RSI: 0x{:x}  RDI: 0x{:x}", f.rdx, f.rsi, f.rdi);
        crate::klog_info!("RBP: 0x{:x}  R8: 0x{:x}  R9: 0x{:x}", f.rbp, f.r8, f.r9);
        crate::klog_info!("R10: 0x{:x}  R11: 0x{:x}  R12: 0x{:x}", f.r10, f.r11, f.r12);
        crate::klog_info!("R13: 0x{:x}  R14: 0x{:x}  R15: 0x{:x}", f.r13, f.r14, f.r15);
        crate::klog_info!("=== END INTERRUPT FRAME DUMP ===");
    }
}

pub fn kdiag_hexdump(data: *const u8, length: usize, base_address: u64) {
    if data.is_null() || length == 0 {
        return;
    }

    let bytes = unsafe { core::slice::from_raw_parts(data, length) };
    let _ = length as c_int;

    let mut i = 0usize;
    while i < length {
        crate::klog_info!("0x{:x}: ", base_address + i as u64);

        let mut j = 0usize;
        while j < 16 && i + j < length {
            if j == 8 {
                crate::klog_info!(" ");
            }
            crate::klog_info!("{:02x} ", bytes[i + j]);
            j += 1;
        }

        while j < 16 {
            if j == 8 {
                crate::klog_info!(" ");
            }
            crate::klog_info!("   ");
            j += 1;
        }

        crate::klog_info!(" |");
        let mut j = 0usize;
        while j < 16 && i + j < length {
            let c = bytes[i + j];
            let display = if (32..=126).contains(&c) {
                c as char
            } else {
                '.'
            };
            crate::klog_info!("{}", display);
            j += 1;
        }
        crate::klog_info!("|");

        i += 16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors_are_named() {
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(3), "Breakpoint");
        assert_eq!(exception_name(200), "Unknown");
    }
}
