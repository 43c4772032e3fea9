//! In-flight call records (spec.md §3 "IPC call", §4.5).

use mk_abi::ipc::{AnswerboxId, CallFlags, IpcPayload, MAX_CALLS_IN_FLIGHT, PhoneId};
use mk_lib::IrqMutex;

use crate::arena::Arena;

/// Lifecycle of one in-flight call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// Enqueued at the target answerbox, awaiting dequeue.
    Pending,
    /// Dequeued by the target, awaiting an answer (sync callers only).
    InProgress,
    /// Answered; the reply payload has been written back.
    Answered,
}

/// One call record: the fixed-width payload plus routing/reply state.
#[derive(Clone, Copy, Debug)]
pub struct Call {
    pub origin_phone: PhoneId,
    pub target_box: AnswerboxId,
    /// Where the reply lands; `PhoneId::INVALID`'s answerbox equivalent
    /// (`AnswerboxId::INVALID`) for a fire-and-forget `call_async` nobody
    /// will ever `wait()` the reply for.
    pub reply_box: AnswerboxId,
    pub payload: IpcPayload,
    pub reply_payload: IpcPayload,
    pub flags: CallFlags,
    pub state: CallState,
}

impl Call {
    pub const fn empty() -> Self {
        Self {
            origin_phone: PhoneId::INVALID,
            target_box: AnswerboxId::INVALID,
            reply_box: AnswerboxId::INVALID,
            payload: IpcPayload { method: 0, args: [0; 5] },
            reply_payload: IpcPayload { method: 0, args: [0; 5] },
            flags: CallFlags::empty(),
            state: CallState::Pending,
        }
    }
}

/// The global table of in-flight calls.
pub struct CallTable {
    inner: IrqMutex<Arena<Call, MAX_CALLS_IN_FLIGHT>>,
}

impl CallTable {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new_named(Arena::new(Call::empty()), "call_table"),
        }
    }

    pub fn insert(&self, call: Call) -> Option<mk_abi::ipc::CallHandle> {
        self.inner
            .lock()
            .insert(call)
            .map(mk_abi::ipc::CallHandle)
    }

    pub fn remove(&self, handle: mk_abi::ipc::CallHandle) -> Option<Call> {
        self.inner.lock().remove(handle.0)
    }

    pub fn get(&self, handle: mk_abi::ipc::CallHandle) -> Option<Call> {
        self.inner.lock().get(handle.0).copied()
    }

    pub fn update(&self, handle: mk_abi::ipc::CallHandle, f: impl FnOnce(&mut Call)) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(handle.0) {
            Some(call) => {
                f(call);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for CallTable {
    fn default() -> Self {
        Self::new()
    }
}
