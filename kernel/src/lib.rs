//! The syscall/trap layer (spec.md §6): decodes what the architecture
//! layer traps, drives `mk-core`/`mk-mm`/`mk-ipc` through it, and encodes
//! results back across the six-machine-word ABI.
//!
//! This crate owns no hardware state of its own — it is entirely built
//! against the collaborator traits in [`collaborators`], which a real
//! arch/boot crate (out of scope here) implements.

#![no_std]

pub mod collaborators;
pub mod dispatch;
pub mod trap;

pub use collaborators::{PageTableWriter, TrapFrame, UserCopy, read_payload, write_payload};
pub use dispatch::{dispatch_syscall, handle_irq, handle_page_fault, handle_timer};
pub use trap::{Dispatcher, TrapVector};
