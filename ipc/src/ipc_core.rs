//! The six IPC syscalls (spec.md §4.5), wired over [`crate::call::CallTable`]
//! and [`crate::answerbox::AnswerboxTable`]. Phone tables are per-task and
//! supplied by the caller (owned by whatever represents a task in
//! `mk-core`) rather than owned here, keeping this crate ignorant of task
//! structure.

use mk_abi::error::{KError, KResult};
use mk_abi::ipc::{AnswerboxId, CallFlags, CallHandle, IpcPayload, PhoneId, PhoneState};
use mk_lib::klog_debug;

use crate::answerbox::{AnswerboxTable, WaitKind, WaitOutcome};
use crate::call::{Call, CallState, CallTable};
use crate::phone::PhoneTable;

/// What `wait()` returned to a caller that doesn't care about the
/// three-way `WaitKind` split, just the payload (used by `call_sync`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    Call { handle: CallHandle, payload: IpcPayload },
    Answer { handle: CallHandle, payload: IpcPayload },
    Notification { handle: CallHandle, payload: IpcPayload },
    Timeout,
    Interrupted,
}

/// Owns the two process-wide IPC tables. One instance per kernel.
pub struct IpcCore {
    pub calls: CallTable,
    pub answerboxes: AnswerboxTable,
}

impl IpcCore {
    pub const fn new() -> Self {
        Self {
            calls: CallTable::new(),
            answerboxes: AnswerboxTable::new(),
        }
    }

    /// `call_async(phone, payload) -> call_handle`.
    pub fn call_async(
        &self,
        phones: &PhoneTable,
        phone: PhoneId,
        payload: IpcPayload,
        reply_box: AnswerboxId,
    ) -> KResult<CallHandle> {
        let state = phones.state(phone).ok_or(KError::NoEnt)?;
        if state == PhoneState::Hungup || state == PhoneState::Free {
            return Err(KError::Hangup);
        }
        let target = phones.target(phone).ok_or(KError::NoEnt)?;
        let answerbox = self.answerboxes.get(target).ok_or(KError::Hangup)?;

        let call = Call {
            origin_phone: phone,
            target_box: target,
            reply_box,
            payload,
            reply_payload: IpcPayload::default(),
            flags: CallFlags::empty(),
            state: CallState::Pending,
        };
        let handle = self.calls.insert(call).ok_or(KError::NoMem)?;
        if answerbox.enqueue_call(handle).is_err() {
            self.calls.remove(handle);
            return Err(KError::Busy);
        }
        klog_debug!("ipc: call_async phone={:?} -> handle={:?}", phone, handle);
        Ok(handle)
    }

    /// `call_sync(phone, payload) -> reply`. Enqueues the call targeting
    /// `reply_box` (the caller's own answerbox) and blocks there for the
    /// matching answer.
    ///
    /// Simplification: this only correctly isolates the matching answer
    /// when `reply_box` carries no other concurrent traffic, which holds
    /// for a pure client task. A task that is simultaneously acting as an
    /// IPC server on the same answerbox should use `wait` directly and
    /// interpret `WaitResult::Answer` itself instead of `call_sync`.
    pub fn call_sync(
        &self,
        phones: &PhoneTable,
        phone: PhoneId,
        payload: IpcPayload,
        reply_box: AnswerboxId,
        timeout_ms: Option<u64>,
    ) -> KResult<IpcPayload> {
        let handle = self.call_async(phones, phone, payload, reply_box)?;
        loop {
            match self.wait(reply_box, timeout_ms, false)? {
                WaitResult::Answer {
                    handle: h,
                    payload: reply,
                } if h == handle => return Ok(reply),
                WaitResult::Timeout => return Err(KError::Timeout),
                WaitResult::Interrupted => return Err(KError::Interrupted),
                // Traffic unrelated to this call landed on our own box
                // first; drop it (see the simplification note above) and
                // keep waiting for our answer.
                _ => continue,
            }
        }
    }

    /// `answer(call_handle, reply_payload)`: deliver the reply to the
    /// call's `reply_box`.
    pub fn answer(&self, handle: CallHandle, reply_payload: IpcPayload) -> KResult<()> {
        let reply_box = self.calls.get(handle).ok_or(KError::NoEnt)?.reply_box;
        self.calls.update(handle, |call| {
            call.reply_payload = reply_payload;
            call.flags |= CallFlags::ANSWER;
            call.state = CallState::Answered;
        });

        if reply_box.is_invalid() {
            // Fire-and-forget `call_async`: nobody is waiting for this
            // reply. The call record stays answered until its caller
            // (if any) reaps it, or forever otherwise.
            return Ok(());
        }
        let answerbox = self.answerboxes.get(reply_box).ok_or(KError::Hangup)?;
        answerbox.enqueue_answer(handle)?;
        klog_debug!("ipc: answer handle={:?}", handle);
        Ok(())
    }

    /// `forward(call_handle, new_phone, new_method)`: re-target an
    /// in-flight call to a different answerbox; the reply path is
    /// unchanged.
    pub fn forward(
        &self,
        phones: &PhoneTable,
        handle: CallHandle,
        new_phone: PhoneId,
        new_method: u64,
    ) -> KResult<()> {
        let new_target = phones.target(new_phone).ok_or(KError::NoEnt)?;
        if phones.state(new_phone) != Some(PhoneState::Connected) {
            return Err(KError::Hangup);
        }
        let new_answerbox = self.answerboxes.get(new_target).ok_or(KError::Hangup)?;

        let updated = self.calls.update(handle, |call| {
            call.target_box = new_target;
            call.payload.method = new_method;
            call.flags |= CallFlags::FORWARDED;
        });
        if !updated {
            return Err(KError::NoEnt);
        }
        new_answerbox.enqueue_call(handle)?;
        klog_debug!("ipc: forward handle={:?} -> phone={:?}", handle, new_phone);
        Ok(())
    }

    /// `wait(answerbox, timeout) -> call`.
    pub fn wait(
        &self,
        answerbox: AnswerboxId,
        timeout_ms: Option<u64>,
        non_blocking: bool,
    ) -> KResult<WaitResult> {
        let bx = self.answerboxes.get(answerbox).ok_or(KError::NoEnt)?;
        match bx.wait(timeout_ms, non_blocking) {
            WaitOutcome::Timeout => Ok(WaitResult::Timeout),
            WaitOutcome::Interrupted => Ok(WaitResult::Interrupted),
            WaitOutcome::WouldBlock => Err(KError::WouldBlock),
            WaitOutcome::Dequeued(kind, handle) => {
                let call = self.calls.get(handle).ok_or(KError::Hangup)?;
                let payload = match kind {
                    WaitKind::Answer | WaitKind::Notification => call.reply_payload,
                    WaitKind::Call => call.payload,
                };
                Ok(match kind {
                    WaitKind::Call => WaitResult::Call { handle, payload },
                    WaitKind::Answer => WaitResult::Answer { handle, payload },
                    WaitKind::Notification => WaitResult::Notification { handle, payload },
                })
            }
        }
    }

    /// `hangup(phone)`: close the phone; if it was the last one targeting
    /// its answerbox, tear the answerbox down, auto-answering every
    /// pending call with `Hangup`.
    pub fn hangup(&self, phones: &PhoneTable, phone: PhoneId) -> KResult<()> {
        let target = phones.hangup(phone)?;
        if target.is_invalid() {
            return Ok(());
        }
        let Some(answerbox) = self.answerboxes.get(target) else {
            return Ok(());
        };
        let remaining = answerbox.drop_phone_ref();
        if remaining > 0 {
            return Ok(());
        }
        self.teardown_answerbox(target);
        Ok(())
    }

    /// Tear down `id` directly, regardless of phone-ref count (used when a
    /// task owning the answerbox exits rather than when its last phone is
    /// hung up).
    pub fn close_answerbox(&self, id: AnswerboxId) {
        self.teardown_answerbox(id);
    }

    /// Drain an answerbox's pending calls, auto-answering each with
    /// `Hangup`, then remove it from the table.
    fn teardown_answerbox(&self, id: AnswerboxId) {
        if let Some(answerbox) = self.answerboxes.get(id) {
            answerbox.drain(|kind, handle| {
                if kind == WaitKind::Call {
                    self.calls.update(handle, |call| {
                        call.flags |= CallFlags::ANSWER;
                        call.state = CallState::Answered;
                    });
                    klog_debug!("ipc: auto-hangup call {:?} at teardown", handle);
                }
            });
        }
        let _ = self.answerboxes.destroy(id);
    }
}

impl Default for IpcCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (IpcCore, PhoneTable, AnswerboxId, AnswerboxId) {
        let core = IpcCore::new();
        let server_box = core.answerboxes.create().unwrap();
        let client_box = core.answerboxes.create().unwrap();
        let phones = PhoneTable::new();
        core.answerboxes.get(server_box).unwrap().add_phone_ref();
        (core, phones, server_box, client_box)
    }

    #[test]
    fn call_async_then_wait_delivers_the_call() {
        let (core, phones, server_box, client_box) = setup();
        let phone = phones.connect(server_box).unwrap();
        let payload = IpcPayload::new(7, [1, 2, 3, 4, 5]);
        let handle = core
            .call_async(&phones, phone, payload, client_box)
            .unwrap();

        match core.wait(server_box, None, true).unwrap() {
            WaitResult::Call { handle: h, payload: p } => {
                assert_eq!(h, handle);
                assert_eq!(p, payload);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn answer_is_delivered_to_reply_box() {
        let (core, phones, server_box, client_box) = setup();
        let phone = phones.connect(server_box).unwrap();
        let payload = IpcPayload::new(1, [0; 5]);
        let handle = core
            .call_async(&phones, phone, payload, client_box)
            .unwrap();
        let reply = IpcPayload::new(99, [9; 5]);
        core.answer(handle, reply).unwrap();

        match core.wait(client_box, None, true).unwrap() {
            WaitResult::Answer { handle: h, payload: p } => {
                assert_eq!(h, handle);
                assert_eq!(p, reply);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn call_into_closed_phone_is_hangup() {
        let (core, phones, server_box, client_box) = setup();
        let phone = phones.connect(server_box).unwrap();
        phones.hangup(phone).unwrap();
        let err = core
            .call_async(&phones, phone, IpcPayload::default(), client_box)
            .unwrap_err();
        assert_eq!(err, KError::Hangup);
    }

    #[test]
    fn hangup_last_phone_tears_down_box_with_hangup_answers() {
        let (core, phones, server_box, client_box) = setup();
        let phone = phones.connect(server_box).unwrap();
        let payload = IpcPayload::new(1, [0; 5]);
        let handle = core
            .call_async(&phones, phone, payload, client_box)
            .unwrap();

        core.hangup(&phones, phone).unwrap();
        assert!(core.answerboxes.get(server_box).is_none());

        let call = core.calls.get(handle).unwrap();
        assert!(call.flags.contains(CallFlags::ANSWER));
        assert_eq!(call.state, CallState::Answered);
    }

    #[test]
    fn forward_retargets_call_and_keeps_reply_box() {
        let (core, phones, server_box, client_box) = setup();
        let other_box = core.answerboxes.create().unwrap();
        core.answerboxes.get(other_box).unwrap().add_phone_ref();
        let phone = phones.connect(server_box).unwrap();
        let other_phone = phones.connect(other_box).unwrap();

        let payload = IpcPayload::new(1, [0; 5]);
        let handle = core
            .call_async(&phones, phone, payload, client_box)
            .unwrap();
        core.wait(server_box, None, true).unwrap();
        core.forward(&phones, handle, other_phone, 55).unwrap();

        match core.wait(other_box, None, true).unwrap() {
            WaitResult::Call { handle: h, payload: p } => {
                assert_eq!(h, handle);
                assert_eq!(p.method, 55);
            }
            other => panic!("unexpected: {other:?}"),
        }
        let call = core.calls.get(handle).unwrap();
        assert_eq!(call.reply_box, client_box);
    }
}
