//! Scripted transport for tests and dry runs.
//!
//! [`MockTransport`] advertises whatever peers a test registers and hands out
//! channels that record every write.  Each registered peer comes with a
//! [`MockPeer`] handle that lets the test push notifications, script how writes
//! are answered, drop the link, and inspect what was written.
//!
//! All peers of one transport share a single event log, so tests can check
//! how writes to different controllers were ordered relative to each other.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use vend_core::Device;

use crate::application::transport::{FrameChannel, Transport, TransportError};

/// Queue depth of the notification channel, matching the BLE adapter.
const NOTIFICATION_CAPACITY: usize = 32;

/// How the mock answers one write.  Unscripted writes are acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Ack,
    Fail(String),
    /// Never completes; the caller's write timeout decides.
    Hang,
    /// The link drops during the write.
    Disconnect,
}

/// Something that happened on a mock channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    WriteStarted(Vec<u8>),
    WriteAcked(Vec<u8>),
    WriteFailed(Vec<u8>),
    Disconnected,
}

/// One entry of the transport-wide log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub address: String,
    pub event: ChannelEvent,
}

type EventLog = Arc<Mutex<Vec<TransportEvent>>>;

struct PeerState {
    device: Device,
    script: VecDeque<WriteOutcome>,
    latency: Duration,
    sender: Option<mpsc::Sender<Vec<u8>>>,
    receiver: Option<mpsc::Receiver<Vec<u8>>>,
    connected: bool,
    refuse_connect: Option<String>,
}

/// Test-side handle on one registered peer.
#[derive(Clone)]
pub struct MockPeer {
    state: Arc<Mutex<PeerState>>,
    log: EventLog,
    acked: Arc<watch::Sender<usize>>,
}

impl MockPeer {
    fn new(device: Device, log: EventLog) -> Self {
        let (acked, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(PeerState {
                device,
                script: VecDeque::new(),
                latency: Duration::ZERO,
                sender: None,
                receiver: None,
                connected: false,
                refuse_connect: None,
            })),
            log,
            acked: Arc::new(acked),
        }
    }

    pub fn device(&self) -> Device {
        self.lock().device.clone()
    }

    /// Appends outcomes for the next writes, in order.
    pub fn script_writes(&self, outcomes: impl IntoIterator<Item = WriteOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Delays every write acknowledgement by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Makes the next connects fail with `reason`.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.lock().refuse_connect = Some(reason.into());
    }

    /// Queues a notification from the controller.
    ///
    /// Frames sent before the bridge subscribes are delivered once it does.
    /// Returns `false` if the peer is not connected.
    pub fn notify(&self, frame: impl Into<Vec<u8>>) -> bool {
        let sender = self.lock().sender.clone();
        match sender {
            Some(sender) => sender.try_send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Simulates the controller going out of range.
    pub fn drop_link(&self) {
        let was_connected = {
            let mut state = self.lock();
            state.sender = None;
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            self.record(ChannelEvent::Disconnected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Frames the peer acknowledged, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ChannelEvent::WriteAcked(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    /// Every event on this peer, in order.
    pub fn events(&self) -> Vec<ChannelEvent> {
        let address = self.lock().device.address.clone();
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.address == address)
            .map(|e| e.event.clone())
            .collect()
    }

    /// Resolves once at least `count` writes have been acknowledged.
    pub async fn wait_for_writes(&self, count: usize) {
        let mut acked = self.acked.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = acked.wait_for(|n| *n >= count).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, event: ChannelEvent) {
        let address = self.lock().device.address.clone();
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TransportEvent { address, event });
    }

    fn open(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if let Some(reason) = &state.refuse_connect {
            return Err(TransportError::Connect {
                address: state.device.address.clone(),
                reason: reason.clone(),
            });
        }
        let (tx, rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        state.sender = Some(tx);
        state.receiver = Some(rx);
        state.connected = true;
        Ok(())
    }
}

/// A [`Transport`] whose peers are registered by the test.
#[derive(Clone, Default)]
pub struct MockTransport {
    peers: Arc<Mutex<HashMap<String, MockPeer>>>,
    order: Arc<Mutex<Vec<String>>>,
    log: EventLog,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an advertising peer and returns its test handle.
    pub fn add_peer(&self, device: Device) -> MockPeer {
        let peer = MockPeer::new(device.clone(), Arc::clone(&self.log));
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers.insert(device.address.clone(), peer.clone()).is_none() {
            self.order
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(device.address);
        }
        peer
    }

    /// The transport-wide event log.
    pub fn events(&self) -> Vec<TransportEvent> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn peer(&self, address: &str) -> Option<MockPeer> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<Device>, TransportError> {
        let order = self.order.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(order
            .iter()
            .filter_map(|address| self.peer(address))
            .map(|peer| peer.device())
            .collect())
    }

    async fn connect(&self, device: &Device) -> Result<Box<dyn FrameChannel>, TransportError> {
        let peer = self
            .peer(&device.address)
            .ok_or_else(|| TransportError::Connect {
                address: device.address.clone(),
                reason: "unknown peer".into(),
            })?;
        peer.open()?;
        Ok(Box::new(MockChannel {
            device: peer.device(),
            peer,
        }))
    }
}

/// The channel handed to the application for a [`MockPeer`].
pub struct MockChannel {
    device: Device,
    peer: MockPeer,
}

#[async_trait]
impl FrameChannel for MockChannel {
    fn peer(&self) -> &Device {
        &self.device
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let (outcome, latency) = {
            let mut state = self.peer.lock();
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            let outcome = state.script.pop_front().unwrap_or(WriteOutcome::Ack);
            (outcome, state.latency)
        };

        self.peer.record(ChannelEvent::WriteStarted(frame.to_vec()));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match outcome {
            WriteOutcome::Ack => {
                self.peer.record(ChannelEvent::WriteAcked(frame.to_vec()));
                self.peer.acked.send_modify(|n| *n += 1);
                Ok(())
            }
            WriteOutcome::Fail(reason) => {
                self.peer.record(ChannelEvent::WriteFailed(frame.to_vec()));
                Err(TransportError::Write(reason))
            }
            WriteOutcome::Hang => std::future::pending().await,
            WriteOutcome::Disconnect => {
                self.peer.drop_link();
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut state = self.peer.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state
            .receiver
            .take()
            .ok_or_else(|| TransportError::Subscribe("already subscribed".into()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peer.drop_link();
        Ok(())
    }
}
