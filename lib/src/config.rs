//! Compile-time kernel defaults (spec.md §9's ambient engineering layer).
//!
//! Modeled on [`crate::testing::config::TestConfig`]: a plain data struct
//! with a `const fn default()`, not wired to any runtime parser, since
//! this workspace has no boot layer to read a command line or device
//! tree. Whatever does boot the kernel overrides fields on the value
//! before handing it to `mk-core`/`mk-mm`/`mk-ipc`'s constructors.

/// Reference configuration for one kernel instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of per-CPU priority-band run queues (spec.md §4.3: "N =
    /// 16"). `mk-core`'s `NUM_PRIORITY_BANDS` is the compiled-in value
    /// this mirrors; the scheduler's queue arrays are not actually
    /// generic over this field, since their size is a const generic
    /// fixed at compile time.
    pub priority_band_count: usize,
    /// `quantum_for_band(band) = quantum_base_ticks + band *
    /// quantum_step_ticks`, matching `mk-core::scheduler`'s per-band
    /// quantum formula (longer quanta for lower-priority bands).
    pub quantum_base_ticks: u32,
    pub quantum_step_ticks: u32,
    /// Fixed-capacity slot count backing every [`crate::WaitQueue`]
    /// (`WAITQUEUE_CAPACITY` in `mk-lib::waitqueue`).
    pub wait_queue_capacity: usize,
    /// ASID pool size handed to `AddressSpaceManager::new` at boot. 256
    /// puts the pool in the lazy-shootdown regime (spec.md §4.4: "≥
    /// 256"); a 64-entry override exercises the broadcast path instead.
    pub asid_pool_size: usize,
    /// Bound on an IRQ filter program's instruction count
    /// (`IRQ_PROGRAM_MAX_LEN` in `mk-abi::irqcode`), enforced at
    /// registration (spec.md §4.5 failure modes).
    pub irq_program_max_len: usize,
    /// Timer ticks between load-balancing passes.
    pub load_balance_interval_ticks: u64,
    /// Minimum ready-queue length gap between the most- and
    /// least-loaded CPU before a balancing pass bothers stealing work.
    pub load_balance_imbalance_threshold: u32,
}

const DEFAULT_PRIORITY_BAND_COUNT: usize = 16;
const DEFAULT_QUANTUM_BASE_TICKS: u32 = 10;
const DEFAULT_QUANTUM_STEP_TICKS: u32 = 2;
const DEFAULT_WAIT_QUEUE_CAPACITY: usize = 32;
const DEFAULT_ASID_POOL_SIZE: usize = 256;
const DEFAULT_IRQ_PROGRAM_MAX_LEN: usize = 64;
const DEFAULT_LOAD_BALANCE_INTERVAL_TICKS: u64 = 64;
const DEFAULT_LOAD_BALANCE_IMBALANCE_THRESHOLD: u32 = 2;

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        priority_band_count: DEFAULT_PRIORITY_BAND_COUNT,
        quantum_base_ticks: DEFAULT_QUANTUM_BASE_TICKS,
        quantum_step_ticks: DEFAULT_QUANTUM_STEP_TICKS,
        wait_queue_capacity: DEFAULT_WAIT_QUEUE_CAPACITY,
        asid_pool_size: DEFAULT_ASID_POOL_SIZE,
        irq_program_max_len: DEFAULT_IRQ_PROGRAM_MAX_LEN,
        load_balance_interval_ticks: DEFAULT_LOAD_BALANCE_INTERVAL_TICKS,
        load_balance_imbalance_threshold: DEFAULT_LOAD_BALANCE_IMBALANCE_THRESHOLD,
    };

    /// Reference value exercising the broadcast-shootdown ASID path
    /// instead of the lazy one (spec.md §4.4: "≤ 64").
    pub const fn small_asid_pool() -> Self {
        Self {
            asid_pool_size: 64,
            ..Self::DEFAULT
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_reference_lazy_shootdown_regime() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.asid_pool_size, 256);
        assert_eq!(cfg.priority_band_count, 16);
    }

    #[test]
    fn small_asid_pool_overrides_only_that_field() {
        let cfg = KernelConfig::small_asid_pool();
        assert_eq!(cfg.asid_pool_size, 64);
        assert_eq!(cfg.wait_queue_capacity, KernelConfig::DEFAULT.wait_queue_capacity);
    }
}
