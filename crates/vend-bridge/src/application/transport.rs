//! The link-layer boundary: finding controllers and exchanging frames with them.
//!
//! The application layer never talks to a Bluetooth stack directly.  It sees a
//! [`Transport`] that can find and connect to peers, and a [`FrameChannel`]
//! per connection exposing the single writable/notifiable characteristic.
//! `infrastructure::transport` provides the BLE and scripted implementations.
//!
//! # Write budget
//!
//! Every write is bounded by a timeout, and a whole write *sequence* (one
//! provisioning call or one session) shares a small budget of retries.
//! [`WritePolicy::budget`] hands out a fresh [`WriteBudget`] per sequence and
//! [`write_with_retry`] spends it.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vend_core::Device;

/// How long discovery waits for a named peer before giving up.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-attempt bound on a single write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Retries available to one write sequence.
pub const DEFAULT_WRITE_RETRIES: u32 = 2;

/// Errors from the transport boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no peer named {name:?} found within {waited:?}")]
    DeviceNotFound { name: String, waited: Duration },

    #[error("bluetooth adapter error: {0}")]
    Adapter(String),

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("failed to subscribe to notifications: {0}")]
    Subscribe(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("write not acknowledged within {0:?}")]
    Timeout(Duration),

    #[error("peer disconnected")]
    Disconnected,
}

/// Finds and connects to controllers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Lists every peer advertising within `timeout`.
    async fn scan(&self, timeout: Duration) -> Result<Vec<Device>, TransportError>;

    /// Waits up to `timeout` for a peer advertising exactly `name`.
    ///
    /// The default implementation runs one full [`Transport::scan`]; adapters
    /// that can stop early should override it.
    async fn discover(&self, name: &str, timeout: Duration) -> Result<Device, TransportError> {
        self.scan(timeout)
            .await?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| TransportError::DeviceNotFound {
                name: name.to_string(),
                waited: timeout,
            })
    }

    /// Opens the frame channel of `device`.
    async fn connect(&self, device: &Device) -> Result<Box<dyn FrameChannel>, TransportError>;
}

/// One connected peer's frame characteristic.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    /// The peer this channel is connected to.
    fn peer(&self) -> &Device;

    /// Writes one frame and resolves once the peer acknowledges it.
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Starts notification delivery.
    ///
    /// The receiver is a bounded FIFO queue; it yields `None` once the peer
    /// disconnects.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Releases the connection.  Calling it twice is harmless.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Write timeout and retry allowance, usually taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WRITE_TIMEOUT,
            retries: DEFAULT_WRITE_RETRIES,
        }
    }
}

impl WritePolicy {
    /// A fresh retry allowance for one write sequence.
    pub fn budget(&self) -> WriteBudget {
        WriteBudget {
            timeout: self.timeout,
            retries_left: self.retries,
        }
    }
}

/// Retries still available to the current write sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBudget {
    timeout: Duration,
    retries_left: u32,
}

impl WriteBudget {
    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }
}

/// Writes `frame`, retrying failed or timed-out attempts while `budget` lasts.
///
/// A disconnect is never retried.  On failure the last error is returned.
///
/// # Errors
///
/// Returns [`TransportError`] once the budget is exhausted or the peer is gone.
pub async fn write_with_retry(
    channel: &dyn FrameChannel,
    frame: &[u8],
    budget: &mut WriteBudget,
) -> Result<(), TransportError> {
    loop {
        let err = match tokio::time::timeout(budget.timeout, channel.write(frame)).await {
            Ok(Ok(())) => {
                debug!(opcode = frame.first().copied(), len = frame.len(), "frame written");
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout(budget.timeout),
        };

        if err == TransportError::Disconnected || budget.retries_left == 0 {
            return Err(err);
        }
        budget.retries_left -= 1;
        warn!(error = %err, retries_left = budget.retries_left, "write failed, retrying");
    }
}
