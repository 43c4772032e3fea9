#![no_std]

pub mod lifecycle;
pub mod load_balance;
pub mod runqueue;
pub mod scheduler;
pub mod task;

pub use lifecycle::Kernel;
pub use load_balance::rebalance_once;
pub use runqueue::RunQueue;
pub use scheduler::{ContextSwitchHooks, Scheduler, init, register_context_switch, scheduler};
pub use task::{TaskRecord, TaskTable, ThreadRecord, ThreadTable};
