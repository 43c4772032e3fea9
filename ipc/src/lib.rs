#![no_std]

mod arena;

pub mod answerbox;
pub mod call;
pub mod ipc_core;
pub mod irq;
pub mod phone;

pub use answerbox::{Answerbox, AnswerboxTable, WaitKind, WaitOutcome};
pub use call::{Call, CallState, CallTable};
pub use ipc_core::{IpcCore, WaitResult};
pub use irq::{IrqRunOutcome, IrqTable, MAX_IRQ_RECORDS, PortIo, accept_to_payload};
pub use phone::{Phone, PhoneTable};
