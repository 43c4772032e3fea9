//! Syscall number definitions (kernel-userland ABI), spec.md §6.
//!
//! A numbered call table, each entry taking up to six machine-word
//! arguments and returning one (a `KError::to_raw()` on failure). The
//! table is partitioned into thread, task, address-space, IPC and
//! debug/observability bands, matching the teacher's convention of a
//! single source-of-truth syscall-number module shared by kernel and
//! userland.

/// Which band a syscall number belongs to, for dispatch-table routing
/// and for the debug/observability band's introspection calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallBand {
    Thread,
    Task,
    AddressSpace,
    Ipc,
    Debug,
}

macro_rules! syscalls {
    ($($band:ident => { $($name:ident = $num:expr),* $(,)? }),* $(,)?) => {
        $(
            $(
                pub const $name: u64 = $num;
            )*
        )*

        /// Look up which band a syscall number belongs to. Used by the
        /// debug band to report per-band call counts.
        pub const fn syscall_band(num: u64) -> Option<SyscallBand> {
            match num {
                $(
                    $($num => Some(SyscallBand::$band),)*
                )*
                _ => None,
            }
        }
    };
}

syscalls! {
    Thread => {
        SYSCALL_THREAD_CREATE = 0,
        SYSCALL_THREAD_EXIT = 1,
        SYSCALL_THREAD_SLEEP = 2,
        SYSCALL_THREAD_JOIN = 3,
        SYSCALL_THREAD_YIELD = 4,
    },
    Task => {
        SYSCALL_TASK_CREATE = 10,
        SYSCALL_TASK_SPAWN = 11,
        SYSCALL_TASK_WAIT = 12,
    },
    AddressSpace => {
        SYSCALL_AS_AREA_CREATE = 20,
        SYSCALL_AS_AREA_RESIZE = 21,
        SYSCALL_AS_AREA_DESTROY = 22,
        SYSCALL_AS_AREA_SHARE = 23,
    },
    Ipc => {
        SYSCALL_IPC_CALL_ASYNC = 30,
        SYSCALL_IPC_CALL_SYNC = 31,
        SYSCALL_IPC_ANSWER = 32,
        SYSCALL_IPC_FORWARD = 33,
        SYSCALL_IPC_WAIT = 34,
        SYSCALL_IPC_HANGUP = 35,
        SYSCALL_IPC_IRQ_REGISTER = 36,
        SYSCALL_IPC_IRQ_UNREGISTER = 37,
    },
    Debug => {
        SYSCALL_DEBUG_SCHED_STATS = 40,
        SYSCALL_DEBUG_ASID_STATS = 41,
    },
}
