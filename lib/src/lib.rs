#![no_std]
#![feature(c_variadic)]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod cpu;

pub mod tsc {
    use core::arch::asm;

    #[inline(always)]
    pub fn rdtsc() -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            asm!(
                "rdtsc",
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        ((hi as u64) << 32) | (lo as u64)
    }
}

pub mod alignment;
pub mod clock;
pub mod config;
pub mod kdiag;
pub mod klog;
pub mod once_lock;
pub mod percpu;
pub mod preempt;
pub mod ring_buffer;
pub mod service_cell;
pub mod spinlock;
pub mod testing;
pub mod waitqueue;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down_u64, align_down_usize, align_up_u64, align_up_usize};
pub use alignment::{align_down_usize as align_down, align_up_usize as align_up};
pub use clock::{monotonic_ns, register_clock_source, uptime_ms};
pub use config::KernelConfig;
pub use kdiag::{InterruptFrame, exception_name, kdiag_dump_interrupt_frame, kdiag_hexdump};
pub use klog::{
    KlogLevel, klog_get_level, klog_init, klog_is_enabled, klog_register_backend, klog_set_level,
};
pub use once_lock::{InitFlag, OnceLock};
pub use percpu::{
    MAX_CPUS, PerCpuData, get_current_cpu, get_cpu_count, get_online_cpu_count, init_bsp, is_bsp,
    is_cpu_online, mark_cpu_offline, mark_cpu_online, register_current_cpu_fn,
};
pub use preempt::{IrqPreemptGuard, PreemptGuard, is_preemption_disabled, preempt_count};
pub use ring_buffer::RingBuffer;
pub use service_cell::ServiceCell;
pub use spinlock::{
    DEADLOCK_PROBE_LIMIT, IrqMutex, IrqMutexGuard, IrqRwLock, IrqRwLockReadGuard,
    IrqRwLockWriteGuard,
};
pub use waitqueue::{ParkOutcome, SchedulerHooks, SleepOutcome, WaitQueue, register_scheduler_hooks};
