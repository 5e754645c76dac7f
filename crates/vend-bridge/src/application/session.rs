//! Runs one vending session against a connected controller.
//!
//! [`VendSession`] is the I/O half of the session: it owns the frame channel,
//! feeds notifications, write results and relay results into the pure
//! [`SessionMachine`] one at a time, and carries out the actions it returns.
//!
//! # Serialisation
//!
//! Inputs are processed strictly one after another.  While a relay call is in
//! flight, notifications that arrive are held back until the relay result has
//! been handled; only cancellation and a closed link end the wait early.
//! Writes are awaited before the next input is taken, so frames for one
//! session never overlap.
//!
//! # One session per controller
//!
//! A [`SessionLease`] from a shared [`SessionRegistry`] is required to build a
//! session and is released when the session is dropped, so two sessions can
//! never run against the same controller at once.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vend_core::{
    Device, Notification, SessionAction, SessionInput, SessionMachine, SessionOutcome,
    SessionState, SiteId, VendProgress,
};

use crate::application::credit_relay::{
    CreditAuthorization, CreditRelayClient, CreditRequest, GeoLocation, RelayError,
};
use crate::application::transport::{
    write_with_retry, FrameChannel, Transport, TransportError, WriteBudget, WritePolicy,
};

/// Capacity of the progress channel handed to the caller.
const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// Errors that prevent a session from starting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session is already active on {0}")]
    AlreadyActive(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Progress reported to whoever started the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    State(SessionState),
    Vend(VendProgress),
    /// Always the last update.
    Finished(SessionOutcome),
}

/// Obtains backend authorization for a vend request.
#[async_trait]
pub trait AuthorizationRelay: Send + Sync {
    async fn authorize(
        &self,
        site_id: SiteId,
        request: CreditRequest,
        location: Option<GeoLocation>,
    ) -> Result<CreditAuthorization, RelayError>;
}

#[async_trait]
impl AuthorizationRelay for CreditRelayClient {
    async fn authorize(
        &self,
        site_id: SiteId,
        request: CreditRequest,
        location: Option<GeoLocation>,
    ) -> Result<CreditAuthorization, RelayError> {
        self.request_authorization(site_id, &request, location).await
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Tracks which controllers currently have a session.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `device` for a new session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyActive`] if a lease for the same address
    /// is still alive.
    pub fn try_acquire(&self, device: &Device) -> Result<SessionLease, SessionError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(device.address.clone()) {
            return Err(SessionError::AlreadyActive(device.address.clone()));
        }
        Ok(SessionLease {
            address: device.address.clone(),
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_active(&self, device: &Device) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&device.address)
    }
}

/// Proof that a controller is reserved for one session.  Released on drop.
#[derive(Debug)]
pub struct SessionLease {
    address: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.address);
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Lets the caller cancel a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cancel: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Requests cancellation.  Calling it more than once has no further effect.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Per-session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub site_id: SiteId,
    pub location: Option<GeoLocation>,
    pub write_policy: WritePolicy,
}

/// One vending session bound to one connected controller.
pub struct VendSession {
    channel: Box<dyn FrameChannel>,
    relay: Arc<dyn AuthorizationRelay>,
    config: SessionConfig,
    updates: mpsc::Sender<SessionUpdate>,
    cancel: watch::Receiver<bool>,
    _lease: SessionLease,
}

impl VendSession {
    /// Builds a session; nothing is written until [`run`](Self::run).
    ///
    /// Returns the session, a handle for cancelling it, and the receiving end
    /// of its progress updates.
    pub fn new(
        channel: Box<dyn FrameChannel>,
        relay: Arc<dyn AuthorizationRelay>,
        config: SessionConfig,
        lease: SessionLease,
    ) -> (Self, SessionHandle, mpsc::Receiver<SessionUpdate>) {
        let (updates, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (cancel_tx, cancel) = watch::channel(false);
        let session = Self {
            channel,
            relay,
            config,
            updates,
            cancel,
            _lease: lease,
        };
        let handle = SessionHandle {
            cancel: Arc::new(cancel_tx),
        };
        (session, handle, updates_rx)
    }

    /// Claims `device`, connects to it and builds a session.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyActive`] if the controller is busy, or the
    /// transport's connect error.
    pub async fn open(
        transport: &dyn Transport,
        registry: &SessionRegistry,
        device: &Device,
        relay: Arc<dyn AuthorizationRelay>,
        config: SessionConfig,
    ) -> Result<(Self, SessionHandle, mpsc::Receiver<SessionUpdate>), SessionError> {
        let lease = registry.try_acquire(device)?;
        let channel = transport.connect(device).await?;
        Ok(Self::new(channel, relay, config, lease))
    }

    /// Drives the session to a terminal state and releases the connection.
    pub async fn run(mut self) -> SessionOutcome {
        let site_id = self.config.site_id;
        info!(site_id = %site_id, peer = %self.channel.peer().address, "session starting");

        let outcome = match self.channel.subscribe().await {
            Ok(notifications) => self.drive(notifications).await,
            Err(e) => {
                let outcome = SessionOutcome::Failed(e.to_string());
                self.report(SessionUpdate::Finished(outcome.clone())).await;
                outcome
            }
        };

        if let Err(e) = self.channel.disconnect().await {
            warn!(error = %e, "disconnect after session failed");
        }
        info!(site_id = %site_id, outcome = ?outcome, "session ended");
        outcome
    }

    async fn drive(&mut self, mut notifications: mpsc::Receiver<Vec<u8>>) -> SessionOutcome {
        let mut machine = SessionMachine::new();
        let mut budget = self.config.write_policy.budget();
        let mut relay: Option<JoinHandle<Result<CreditAuthorization, RelayError>>> = None;
        let mut inputs = VecDeque::from([SessionInput::Begin]);
        let mut deferred = VecDeque::new();

        loop {
            let input = match inputs.pop_front() {
                Some(input) => input,
                None => {
                    self.next_input(&mut notifications, &mut deferred, &mut relay)
                        .await
                }
            };

            let before = machine.state();
            let actions = match machine.handle(input) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!(error = %e, "ignoring input");
                    continue;
                }
            };
            if machine.state() != before {
                self.report(SessionUpdate::State(machine.state())).await;
            }

            for action in actions {
                match action {
                    SessionAction::Write(frame) => {
                        inputs.push_back(self.write(&frame, &mut budget).await);
                    }
                    SessionAction::WriteBestEffort(frame) => {
                        let single_attempt = WritePolicy {
                            retries: 0,
                            ..self.config.write_policy
                        };
                        let mut once = single_attempt.budget();
                        if let Err(e) =
                            write_with_retry(self.channel.as_ref(), &frame, &mut once).await
                        {
                            debug!(error = %e, "best-effort write not delivered");
                        }
                    }
                    SessionAction::RequestAuthorization { request, details } => {
                        info!(
                            price = details.price,
                            item = details.item_number,
                            nonce = details.nonce,
                            "relaying vend request"
                        );
                        let relay_client = Arc::clone(&self.relay);
                        let location = self.config.location;
                        let site_id = self.config.site_id;
                        relay = Some(tokio::spawn(async move {
                            relay_client
                                .authorize(site_id, CreditRequest(request), location)
                                .await
                        }));
                    }
                    SessionAction::Progress(progress) => {
                        self.report(SessionUpdate::Vend(progress)).await;
                    }
                    SessionAction::Finish(outcome) => {
                        // An unfinished relay keeps running; its result is dropped with the handle.
                        drop(relay.take());
                        self.report(SessionUpdate::Finished(outcome.clone())).await;
                        return outcome;
                    }
                }
            }
        }
    }

    /// Waits for the next external event.
    ///
    /// While a relay call is pending, notifications are still read so a
    /// closed link is seen at once; the frames themselves are parked in
    /// `deferred` and handed to the machine after the relay result.
    async fn next_input(
        &mut self,
        notifications: &mut mpsc::Receiver<Vec<u8>>,
        deferred: &mut VecDeque<Vec<u8>>,
        relay: &mut Option<JoinHandle<Result<CreditAuthorization, RelayError>>>,
    ) -> SessionInput {
        if let Some(pending) = relay.as_mut() {
            let result = loop {
                tokio::select! {
                    biased;
                    _ = wait_cancelled(&mut self.cancel) => return SessionInput::CancelRequested,
                    joined = &mut *pending => break joined,
                    frame = notifications.recv() => match frame {
                        Some(frame) => deferred.push_back(frame),
                        None => {
                            info!("link lost while waiting for the backend");
                            return SessionInput::Disconnected;
                        }
                    },
                }
            };
            *relay = None;
            let result = match result {
                Ok(Ok(authorization)) => Ok(authorization.payload),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("relay task failed: {e}")),
            };
            return SessionInput::RelayCompleted(result);
        }

        while let Some(frame) = deferred.pop_front() {
            if let Some(input) = parse_notification(&frame) {
                return input;
            }
        }

        loop {
            let frame = tokio::select! {
                biased;
                _ = wait_cancelled(&mut self.cancel) => return SessionInput::CancelRequested,
                frame = notifications.recv() => frame,
            };
            let Some(frame) = frame else {
                return SessionInput::Disconnected;
            };
            if let Some(input) = parse_notification(&frame) {
                return input;
            }
        }
    }

    /// Performs an acknowledged write, giving way to cancellation.
    async fn write(&mut self, frame: &[u8], budget: &mut WriteBudget) -> SessionInput {
        let channel = self.channel.as_ref();
        tokio::select! {
            biased;
            _ = wait_cancelled(&mut self.cancel) => SessionInput::CancelRequested,
            result = write_with_retry(channel, frame, budget) => match result {
                Ok(()) => SessionInput::WriteAcked,
                Err(TransportError::Disconnected) => SessionInput::Disconnected,
                Err(e) => SessionInput::WriteFailed(e.to_string()),
            },
        }
    }

    async fn report(&self, update: SessionUpdate) {
        // The caller may have stopped listening; the session still runs to completion.
        let _ = self.updates.send(update).await;
    }
}

/// Turns a raw notification into an input; malformed frames are logged and skipped.
fn parse_notification(frame: &[u8]) -> Option<SessionInput> {
    match Notification::parse(frame) {
        Ok(notification) => {
            debug!(opcode = %notification.opcode(), "notification");
            Some(SessionInput::Notification(notification))
        }
        Err(e) => {
            warn!(error = %e, len = frame.len(), "ignoring malformed notification");
            None
        }
    }
}

/// Resolves once cancellation is requested; never resolves if the handle is gone.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
