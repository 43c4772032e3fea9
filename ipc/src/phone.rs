//! Phones: a task's handle onto another task's answerbox (spec.md §3, §4.5).

use mk_abi::error::{KError, KResult};
use mk_abi::ipc::{AnswerboxId, MAX_PHONES_PER_TASK, PhoneId, PhoneState};
use mk_lib::IrqMutex;

use crate::arena::Arena;

/// One phone: the state machine plus the answerbox it targets once
/// connected.
#[derive(Clone, Copy, Debug)]
pub struct Phone {
    pub state: PhoneState,
    pub target: AnswerboxId,
}

impl Phone {
    pub const fn empty() -> Self {
        Self {
            state: PhoneState::Free,
            target: AnswerboxId::INVALID,
        }
    }
}

/// A task's phone table: up to [`MAX_PHONES_PER_TASK`] phones. Owned by
/// whatever represents a task in `mk-core`; this crate only supplies the
/// type and its operations.
pub struct PhoneTable {
    inner: IrqMutex<Arena<Phone, MAX_PHONES_PER_TASK>>,
}

impl PhoneTable {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new_named(Arena::new(Phone::empty()), "phone_table"),
        }
    }

    /// Open a new phone connected to `target` (`Free -> Connecting ->
    /// Connected`, collapsed into one step since nothing here models a
    /// multi-phase handshake).
    pub fn connect(&self, target: AnswerboxId) -> KResult<PhoneId> {
        let mut inner = self.inner.lock();
        inner
            .insert(Phone {
                state: PhoneState::Connected,
                target,
            })
            .map(PhoneId)
            .ok_or(KError::NoMem)
    }

    /// `hangup(phone)`: mark closed. Idempotent-safe: hanging up an
    /// already-hungup phone is a no-op rather than an error, matching the
    /// teacher's tolerance for redundant teardown calls.
    pub fn hangup(&self, phone: PhoneId) -> KResult<AnswerboxId> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(phone.0).ok_or(KError::NoEnt)?;
        if entry.state == PhoneState::Hungup {
            return Ok(entry.target);
        }
        if !entry.state.can_transition_to(PhoneState::Hungup) {
            return Err(KError::Invalid);
        }
        entry.state = PhoneState::Hungup;
        Ok(entry.target)
    }

    pub fn state(&self, phone: PhoneId) -> Option<PhoneState> {
        self.inner.lock().get(phone.0).map(|p| p.state)
    }

    pub fn target(&self, phone: PhoneId) -> Option<AnswerboxId> {
        self.inner.lock().get(phone.0).map(|p| p.target)
    }

    /// Visit every still-connected phone. Used by task teardown to hang
    /// up everything a task held open without the caller needing to
    /// track phone ids itself.
    pub fn for_each_connected(&self, mut f: impl FnMut(PhoneId)) {
        self.inner.lock().for_each(|handle, phone| {
            if phone.state == PhoneState::Connected {
                f(PhoneId(handle));
            }
        });
    }
}

impl Default for PhoneTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_then_hangup_transitions_state() {
        let table = PhoneTable::new();
        let phone = table.connect(AnswerboxId::new(3, 0)).unwrap();
        assert_eq!(table.state(phone), Some(PhoneState::Connected));
        table.hangup(phone).unwrap();
        assert_eq!(table.state(phone), Some(PhoneState::Hungup));
    }

    #[test]
    fn hangup_is_idempotent() {
        let table = PhoneTable::new();
        let phone = table.connect(AnswerboxId::new(3, 0)).unwrap();
        table.hangup(phone).unwrap();
        table.hangup(phone).unwrap();
        assert_eq!(table.state(phone), Some(PhoneState::Hungup));
    }
}
