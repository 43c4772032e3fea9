//! Per-CPU data infrastructure.
//!
//! Every CPU owns one [`PerCpuData`] slot, looked up through a registered
//! `current_cpu` hook (the same registration idiom [`crate::klog`] uses for
//! its backend): this crate has no boot layer to do APIC bring-up or
//! GS-segment base programming, so it cannot itself answer "which CPU am
//! I". A collaborator that does know (the kernel's SMP bring-up code)
//! registers the hook once at boot; before that, CPU 0 is assumed.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::once_lock::InitFlag;

/// Maximum number of CPUs supported.
pub const MAX_CPUS: usize = 32;

/// Per-CPU data structure — one instance per CPU, cache-line aligned to
/// avoid false sharing.
#[repr(C, align(64))]
pub struct PerCpuData {
    pub cpu_id: AtomicU32,
    pub online: AtomicBool,
    pub current_task: AtomicPtr<()>,
    pub scheduler: AtomicPtr<()>,
    pub preempt_count: AtomicU32,
    pub reschedule_pending: AtomicU32,
    pub in_interrupt: AtomicBool,
    pub context_switches: AtomicU64,
    pub interrupt_count: AtomicU64,
}

impl PerCpuData {
    const fn new() -> Self {
        Self {
            cpu_id: AtomicU32::new(0),
            online: AtomicBool::new(false),
            current_task: AtomicPtr::new(ptr::null_mut()),
            scheduler: AtomicPtr::new(ptr::null_mut()),
            preempt_count: AtomicU32::new(0),
            reschedule_pending: AtomicU32::new(0),
            in_interrupt: AtomicBool::new(false),
            context_switches: AtomicU64::new(0),
            interrupt_count: AtomicU64::new(0),
        }
    }
}

// SAFETY: all mutable fields are atomics; the struct is only ever accessed
// through `&'static` references indexed by CPU id.
unsafe impl Sync for PerCpuData {}

static PER_CPU_DATA: [PerCpuData; MAX_CPUS] = {
    const INIT: PerCpuData = PerCpuData::new();
    [INIT; MAX_CPUS]
};

static CPU_COUNT: AtomicU32 = AtomicU32::new(1);
static PERCPU_INIT: InitFlag = InitFlag::new();

/// Hook returning the calling CPU's index. Registered by the collaborator
/// that owns SMP bring-up; defaults to "always CPU 0" (correct for the
/// single-core case this crate can exercise on its own).
static CURRENT_CPU_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Register the function used to resolve the calling CPU's index.
pub fn register_current_cpu_fn(f: fn() -> usize) {
    CURRENT_CPU_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
pub fn get_current_cpu() -> usize {
    let ptr = CURRENT_CPU_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        0
    } else {
        // SAFETY: only `register_current_cpu_fn` ever stores into this cell,
        // and only with a `fn() -> usize`.
        let f: fn() -> usize = unsafe { core::mem::transmute(ptr) };
        f().min(MAX_CPUS - 1)
    }
}

/// Bring up per-CPU bookkeeping for the boot CPU. Idempotent.
pub fn init_bsp() {
    if !PERCPU_INIT.init_once() {
        return;
    }
    mark_cpu_online(0);
}

/// Register that `cpu_id` has come online, bumping the CPU count if needed.
pub fn mark_cpu_online(cpu_id: usize) {
    if cpu_id >= MAX_CPUS {
        return;
    }
    PER_CPU_DATA[cpu_id]
        .cpu_id
        .store(cpu_id as u32, Ordering::Release);
    PER_CPU_DATA[cpu_id].online.store(true, Ordering::Release);
    let current = CPU_COUNT.load(Ordering::Acquire);
    if cpu_id as u32 >= current {
        CPU_COUNT.store(cpu_id as u32 + 1, Ordering::Release);
    }
}

pub fn mark_cpu_offline(cpu_id: usize) {
    if cpu_id < MAX_CPUS {
        PER_CPU_DATA[cpu_id].online.store(false, Ordering::Release);
    }
}

#[inline]
pub fn is_cpu_online(cpu_id: usize) -> bool {
    cpu_id < MAX_CPUS && PER_CPU_DATA[cpu_id].online.load(Ordering::Acquire)
}

#[inline]
pub fn get_cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire) as usize
}

pub fn get_online_cpu_count() -> usize {
    (0..get_cpu_count()).filter(|&i| is_cpu_online(i)).count()
}

#[inline]
pub fn is_bsp() -> bool {
    get_current_cpu() == 0
}

/// Get the current CPU's per-CPU data.
#[inline]
pub fn current() -> &'static PerCpuData {
    &PER_CPU_DATA[get_current_cpu()]
}

/// Get the per-CPU data for a specific CPU, if it has come online.
#[inline]
pub fn for_cpu(cpu_id: usize) -> Option<&'static PerCpuData> {
    if cpu_id < MAX_CPUS && is_cpu_online(cpu_id) {
        Some(&PER_CPU_DATA[cpu_id])
    } else {
        None
    }
}

#[inline]
pub fn set_current_task(task: *mut ()) {
    current().current_task.store(task, Ordering::Release);
}

#[inline]
pub fn get_current_task() -> *mut () {
    current().current_task.load(Ordering::Acquire)
}
