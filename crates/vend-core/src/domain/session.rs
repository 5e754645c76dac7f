//! The vending session state machine.
//!
//! [`SessionMachine`] owns no I/O.  It is fed one [`SessionInput`] at a time
//! through [`SessionMachine::handle`] and answers with the [`SessionAction`]s
//! the driver must carry out: frames to write, a relay call to start, progress
//! to report, or the final outcome.  Results of those actions come back in as
//! further inputs (`WriteAcked`, `RelayCompleted`, ...).
//!
//! ```text
//!  Idle ──Begin──▶ Beginning ──WriteAcked──▶ Active ◀─────────────┐
//!                      │                       │  │                │
//!                 WriteFailed        VEND_REQUEST  SESSION_COMPLETE │
//!                      ▼                       ▼  ▼                │
//!                   Failed     AwaitingAuthorization   Complete    │
//!                      ▲           │ ok        │ err               │
//!                      │           ▼           ▼                   │
//!                      │      Forwarding ──▶ Cancelling            │
//!                      │           │ ack  fail   │ any ack         │
//!                      │           └─────────────┼─────────────────┘
//!                      └─────────────────────────┘
//!
//!  any non-terminal ──CancelRequested / Disconnected──▶ Cancelled
//! ```
//!
//! A session services at most one vend cycle.  Inputs that make no sense in
//! the current state are returned as [`ProtocolError`] and leave the state
//! untouched, so the driver can log them and carry on.

use thiserror::Error;
use tracing::debug;

use crate::protocol::codec::CONTROL_FRAME_LEN;
use crate::protocol::notification::{Notification, VendDetails};
use crate::protocol::opcode::Opcode;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// BEGIN_SESSION written, waiting for the acknowledgment.
    Beginning,
    Active,
    /// The device's vend request is with the backend.
    AwaitingAuthorization,
    /// The backend's authorization is being written to the device.
    Forwarding,
    /// CANCEL_SESSION written after a failed relay, waiting for it to settle.
    Cancelling,
    Complete,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// Events fed into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// The caller wants to open the session.
    Begin,
    /// The last [`SessionAction::Write`] was acknowledged by the device.
    WriteAcked,
    /// The last [`SessionAction::Write`] failed after its retry budget.
    WriteFailed(String),
    Notification(Notification),
    /// Outcome of the relay started by [`SessionAction::RequestAuthorization`].
    RelayCompleted(Result<Vec<u8>, String>),
    CancelRequested,
    Disconnected,
}

impl SessionInput {
    fn name(&self) -> &'static str {
        match self {
            SessionInput::Begin => "begin",
            SessionInput::WriteAcked => "write ack",
            SessionInput::WriteFailed(_) => "write failure",
            SessionInput::Notification(Notification::VendRequest { .. }) => "VEND_REQUEST",
            SessionInput::Notification(Notification::VendSuccess(_)) => "VEND_SUCCESS",
            SessionInput::Notification(Notification::VendFailure(_)) => "VEND_FAILURE",
            SessionInput::Notification(Notification::SessionComplete) => "SESSION_COMPLETE",
            SessionInput::RelayCompleted(_) => "relay result",
            SessionInput::CancelRequested => "cancel request",
            SessionInput::Disconnected => "disconnect",
        }
    }
}

/// How a session ended.  Reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Informational vend results reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendProgress {
    Succeeded(VendDetails),
    Failed(VendDetails),
}

/// Work the driver must perform in response to an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write these bytes and report the result as `WriteAcked` / `WriteFailed`.
    Write(Vec<u8>),
    /// Write these bytes if the link is still up; the result is not fed back.
    WriteBestEffort(Vec<u8>),
    /// Relay `request` to the backend and report back with `RelayCompleted`.
    RequestAuthorization {
        request: Vec<u8>,
        details: VendDetails,
    },
    Progress(VendProgress),
    Finish(SessionOutcome),
}

/// Inputs the machine refused.  The state is unchanged when one is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected {input} in state {state:?}")]
    Unexpected {
        state: SessionState,
        input: &'static str,
    },

    #[error("a second VEND_REQUEST (nonce {nonce}) is not serviced by this session")]
    RepeatedVendRequest { nonce: u16 },

    #[error("session already ended in state {0:?}")]
    Terminated(SessionState),
}

/// One vending session with one device.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    last_nonce: Option<u16>,
    vend_serviced: bool,
    failure_reason: Option<String>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            last_nonce: None,
            vend_serviced: false,
            failure_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Nonce of the most recent vend frame seen from the device.
    pub fn last_nonce(&self) -> Option<u16> {
        self.last_nonce
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies one input and returns the actions it triggers.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for inputs that do not apply to the current
    /// state.  The machine is left exactly as it was.
    pub fn handle(&mut self, input: SessionInput) -> Result<Vec<SessionAction>, ProtocolError> {
        if self.state.is_terminal() {
            return Err(ProtocolError::Terminated(self.state));
        }

        let from = self.state;
        let input_name = input.name();
        let actions = self.transition(input)?;
        if from != self.state {
            debug!(from = ?from, to = ?self.state, input = input_name, "session transition");
        }
        Ok(actions)
    }

    fn transition(&mut self, input: SessionInput) -> Result<Vec<SessionAction>, ProtocolError> {
        use SessionState as S;

        match (self.state, input) {
            // Cancellation and disconnect apply everywhere.
            (S::Idle, SessionInput::CancelRequested) | (_, SessionInput::Disconnected) => {
                Ok(self.finish(S::Cancelled, SessionOutcome::Cancelled))
            }
            (S::Cancelling, SessionInput::CancelRequested) => {
                // CANCEL_SESSION is already on its way
                Ok(self.finish(S::Cancelled, SessionOutcome::Cancelled))
            }
            (_, SessionInput::CancelRequested) => {
                let mut actions = vec![SessionAction::WriteBestEffort(bare_frame(
                    Opcode::CancelSession,
                ))];
                actions.extend(self.finish(S::Cancelled, SessionOutcome::Cancelled));
                Ok(actions)
            }

            (S::Idle, SessionInput::Begin) => {
                self.state = S::Beginning;
                Ok(vec![SessionAction::Write(bare_frame(Opcode::BeginSession))])
            }
            (S::Beginning, SessionInput::WriteAcked) => {
                self.state = S::Active;
                Ok(Vec::new())
            }
            (S::Beginning, SessionInput::WriteFailed(reason)) => Ok(self.finish(
                S::Failed,
                SessionOutcome::Failed(format!("BEGIN_SESSION not delivered: {reason}")),
            )),

            (S::Active, SessionInput::Notification(notification)) => {
                self.on_notification(notification)
            }

            (S::AwaitingAuthorization, SessionInput::RelayCompleted(Ok(authorization))) => {
                self.state = S::Forwarding;
                Ok(vec![SessionAction::Write(authorization)])
            }
            (S::AwaitingAuthorization, SessionInput::RelayCompleted(Err(reason))) => {
                Ok(self.start_cancelling(format!("authorization failed: {reason}")))
            }

            (S::Forwarding, SessionInput::WriteAcked) => {
                self.state = S::Active;
                Ok(Vec::new())
            }
            (S::Forwarding, SessionInput::WriteFailed(reason)) => {
                Ok(self.start_cancelling(format!("authorization not delivered: {reason}")))
            }

            (S::Cancelling, SessionInput::WriteAcked | SessionInput::WriteFailed(_)) => {
                let reason = self
                    .failure_reason
                    .take()
                    .unwrap_or_else(|| "session cancelled after failure".to_string());
                Ok(self.finish(S::Failed, SessionOutcome::Failed(reason)))
            }

            (state, input) => Err(ProtocolError::Unexpected {
                state,
                input: input.name(),
            }),
        }
    }

    fn on_notification(
        &mut self,
        notification: Notification,
    ) -> Result<Vec<SessionAction>, ProtocolError> {
        match notification {
            Notification::VendRequest { details, raw } => {
                if self.vend_serviced {
                    return Err(ProtocolError::RepeatedVendRequest {
                        nonce: details.nonce,
                    });
                }
                self.vend_serviced = true;
                self.last_nonce = Some(details.nonce);
                self.state = SessionState::AwaitingAuthorization;
                Ok(vec![SessionAction::RequestAuthorization {
                    request: raw,
                    details,
                }])
            }
            Notification::VendSuccess(details) => {
                self.last_nonce = Some(details.nonce);
                Ok(vec![SessionAction::Progress(VendProgress::Succeeded(details))])
            }
            Notification::VendFailure(details) => {
                self.last_nonce = Some(details.nonce);
                Ok(vec![SessionAction::Progress(VendProgress::Failed(details))])
            }
            Notification::SessionComplete => {
                Ok(self.finish(SessionState::Complete, SessionOutcome::Completed))
            }
        }
    }

    fn start_cancelling(&mut self, reason: String) -> Vec<SessionAction> {
        self.failure_reason = Some(reason);
        self.state = SessionState::Cancelling;
        vec![SessionAction::Write(bare_frame(Opcode::CancelSession))]
    }

    fn finish(&mut self, terminal: SessionState, outcome: SessionOutcome) -> Vec<SessionAction> {
        self.state = terminal;
        vec![SessionAction::Finish(outcome)]
    }
}

/// A control frame for `opcode` with every numeric field zero.
fn bare_frame(opcode: Opcode) -> Vec<u8> {
    let mut frame = vec![0u8; CONTROL_FRAME_LEN];
    frame[0] = opcode.as_byte();
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode_control;

    fn vend_request(price: u16, item: u16, nonce: u16) -> SessionInput {
        let raw = encode_control(Opcode::VendRequest, price, item, nonce).unwrap();
        SessionInput::Notification(Notification::parse(&raw).unwrap())
    }

    fn active_machine() -> SessionMachine {
        let mut m = SessionMachine::new();
        m.handle(SessionInput::Begin).unwrap();
        m.handle(SessionInput::WriteAcked).unwrap();
        assert_eq!(m.state(), SessionState::Active);
        m
    }

    fn details(price: u16, item_number: u16, nonce: u16) -> VendDetails {
        VendDetails {
            price,
            item_number,
            nonce,
        }
    }

    // ── Opening ──────────────────────────────────────────────────────────────

    #[test]
    fn test_begin_writes_bare_begin_frame() {
        let mut m = SessionMachine::new();

        let actions = m.handle(SessionInput::Begin).unwrap();

        assert_eq!(
            actions,
            vec![SessionAction::Write(vec![0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0])]
        );
        assert_eq!(m.state(), SessionState::Beginning);
    }

    #[test]
    fn test_begin_write_failure_fails_session() {
        let mut m = SessionMachine::new();
        m.handle(SessionInput::Begin).unwrap();

        let actions = m.handle(SessionInput::WriteFailed("timeout".into())).unwrap();

        assert_eq!(m.state(), SessionState::Failed);
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Finish(SessionOutcome::Failed(reason))] if reason.contains("timeout")
        ));
    }

    #[test]
    fn test_notification_before_ack_is_rejected() {
        let mut m = SessionMachine::new();
        m.handle(SessionInput::Begin).unwrap();

        let err = m
            .handle(SessionInput::Notification(Notification::SessionComplete))
            .unwrap_err();

        assert_eq!(
            err,
            ProtocolError::Unexpected {
                state: SessionState::Beginning,
                input: "SESSION_COMPLETE"
            }
        );
        assert_eq!(m.state(), SessionState::Beginning);
    }

    // ── Vend cycle ───────────────────────────────────────────────────────────

    #[test]
    fn test_vend_request_asks_for_authorization_with_raw_bytes() {
        let mut m = active_machine();

        let actions = m.handle(vend_request(150, 7, 42)).unwrap();

        let expected_raw = encode_control(Opcode::VendRequest, 150, 7, 42).unwrap().to_vec();
        assert_eq!(
            actions,
            vec![SessionAction::RequestAuthorization {
                request: expected_raw,
                details: details(150, 7, 42),
            }]
        );
        assert_eq!(m.state(), SessionState::AwaitingAuthorization);
        assert_eq!(m.last_nonce(), Some(42));
    }

    #[test]
    fn test_full_vend_cycle_completes() {
        let mut m = active_machine();
        m.handle(vend_request(150, 7, 42)).unwrap();

        let write = m
            .handle(SessionInput::RelayCompleted(Ok(vec![0x0A, 0x01, 0x02])))
            .unwrap();
        assert_eq!(write, vec![SessionAction::Write(vec![0x0A, 0x01, 0x02])]);
        assert_eq!(m.state(), SessionState::Forwarding);

        m.handle(SessionInput::WriteAcked).unwrap();
        assert_eq!(m.state(), SessionState::Active);

        let progress = m
            .handle(SessionInput::Notification(Notification::VendSuccess(details(
                150, 7, 42,
            ))))
            .unwrap();
        assert_eq!(
            progress,
            vec![SessionAction::Progress(VendProgress::Succeeded(details(
                150, 7, 42
            )))]
        );

        let done = m
            .handle(SessionInput::Notification(Notification::SessionComplete))
            .unwrap();
        assert_eq!(done, vec![SessionAction::Finish(SessionOutcome::Completed)]);
        assert_eq!(m.state(), SessionState::Complete);
    }

    #[test]
    fn test_session_complete_without_vend_request() {
        let mut m = active_machine();

        let actions = m
            .handle(SessionInput::Notification(Notification::SessionComplete))
            .unwrap();

        assert_eq!(actions, vec![SessionAction::Finish(SessionOutcome::Completed)]);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, SessionAction::RequestAuthorization { .. })));
    }

    #[test]
    fn test_vend_failure_is_informational() {
        let mut m = active_machine();

        let actions = m
            .handle(SessionInput::Notification(Notification::VendFailure(details(
                150, 7, 43,
            ))))
            .unwrap();

        assert_eq!(
            actions,
            vec![SessionAction::Progress(VendProgress::Failed(details(
                150, 7, 43
            )))]
        );
        assert_eq!(m.state(), SessionState::Active);
        assert_eq!(m.last_nonce(), Some(43));
    }

    #[test]
    fn test_second_vend_request_is_not_serviced() {
        let mut m = active_machine();
        m.handle(vend_request(150, 7, 42)).unwrap();
        m.handle(SessionInput::RelayCompleted(Ok(vec![1]))).unwrap();
        m.handle(SessionInput::WriteAcked).unwrap();

        let err = m.handle(vend_request(200, 8, 43)).unwrap_err();

        assert_eq!(err, ProtocolError::RepeatedVendRequest { nonce: 43 });
        assert_eq!(m.state(), SessionState::Active);
    }

    // ── Failure paths ────────────────────────────────────────────────────────

    #[test]
    fn test_relay_failure_cancels_then_fails() {
        let mut m = active_machine();
        m.handle(vend_request(150, 7, 42)).unwrap();

        let cancel = m
            .handle(SessionInput::RelayCompleted(Err("status 500".into())))
            .unwrap();
        assert_eq!(
            cancel,
            vec![SessionAction::Write(vec![0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0])]
        );
        assert_eq!(m.state(), SessionState::Cancelling);

        let finish = m.handle(SessionInput::WriteAcked).unwrap();
        assert!(matches!(
            finish.as_slice(),
            [SessionAction::Finish(SessionOutcome::Failed(reason))] if reason.contains("status 500")
        ));
        assert_eq!(m.state(), SessionState::Failed);
    }

    #[test]
    fn test_cancel_write_failure_still_fails_session() {
        let mut m = active_machine();
        m.handle(vend_request(150, 7, 42)).unwrap();
        m.handle(SessionInput::RelayCompleted(Err("declined".into())))
            .unwrap();

        let finish = m.handle(SessionInput::WriteFailed("gone".into())).unwrap();

        assert!(matches!(
            finish.as_slice(),
            [SessionAction::Finish(SessionOutcome::Failed(_))]
        ));
    }

    #[test]
    fn test_authorization_write_failure_cancels() {
        let mut m = active_machine();
        m.handle(vend_request(150, 7, 42)).unwrap();
        m.handle(SessionInput::RelayCompleted(Ok(vec![9]))).unwrap();

        let actions = m.handle(SessionInput::WriteFailed("timeout".into())).unwrap();

        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], SessionAction::Write(b) if b[0] == 0x04));
        assert_eq!(m.state(), SessionState::Cancelling);
    }

    #[test]
    fn test_stale_relay_result_in_active_is_rejected() {
        let mut m = active_machine();
        assert!(matches!(
            m.handle(SessionInput::RelayCompleted(Ok(vec![1]))),
            Err(ProtocolError::Unexpected { .. })
        ));
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    #[test]
    fn test_cancel_while_active_writes_cancel_best_effort() {
        let mut m = active_machine();

        let actions = m.handle(SessionInput::CancelRequested).unwrap();

        assert_eq!(
            actions,
            vec![
                SessionAction::WriteBestEffort(vec![0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
                SessionAction::Finish(SessionOutcome::Cancelled),
            ]
        );
        assert_eq!(m.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_cancel_while_awaiting_authorization() {
        let mut m = active_machine();
        m.handle(vend_request(150, 7, 42)).unwrap();

        let actions = m.handle(SessionInput::CancelRequested).unwrap();

        assert_eq!(
            actions.last(),
            Some(&SessionAction::Finish(SessionOutcome::Cancelled))
        );
        // a late relay result is refused
        assert_eq!(
            m.handle(SessionInput::RelayCompleted(Ok(vec![1]))),
            Err(ProtocolError::Terminated(SessionState::Cancelled))
        );
    }

    #[test]
    fn test_cancel_before_begin_writes_nothing() {
        let mut m = SessionMachine::new();
        assert_eq!(
            m.handle(SessionInput::CancelRequested).unwrap(),
            vec![SessionAction::Finish(SessionOutcome::Cancelled)]
        );
    }

    #[test]
    fn test_disconnect_cancels_without_write() {
        let mut m = active_machine();

        let actions = m.handle(SessionInput::Disconnected).unwrap();

        assert_eq!(actions, vec![SessionAction::Finish(SessionOutcome::Cancelled)]);
        assert_eq!(m.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_cancel_while_cancelling_does_not_write_again() {
        let mut m = active_machine();
        m.handle(vend_request(150, 7, 42)).unwrap();
        m.handle(SessionInput::RelayCompleted(Err("x".into()))).unwrap();

        let actions = m.handle(SessionInput::CancelRequested).unwrap();

        assert_eq!(actions, vec![SessionAction::Finish(SessionOutcome::Cancelled)]);
    }

    // ── Terminal states ──────────────────────────────────────────────────────

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut m = active_machine();
        m.handle(SessionInput::Notification(Notification::SessionComplete))
            .unwrap();

        for input in [
            SessionInput::Begin,
            SessionInput::WriteAcked,
            SessionInput::CancelRequested,
            SessionInput::Disconnected,
            vend_request(1, 1, 1),
        ] {
            assert_eq!(
                m.handle(input),
                Err(ProtocolError::Terminated(SessionState::Complete))
            );
        }
    }

    #[test]
    fn test_is_terminal() {
        assert!(SessionState::Complete.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Cancelling.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
    }
}
