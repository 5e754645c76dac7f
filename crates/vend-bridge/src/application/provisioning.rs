//! Provisioning writes: registering a controller and giving it Wi-Fi credentials.
//!
//! Both operations are two provisioning frames written back to back.  The
//! second frame goes out only after the first is acknowledged; if the first
//! fails the call fails and the second is never attempted.  Both frames are
//! encoded before anything is written, so an over-long value is reported
//! without touching the controller.

use thiserror::Error;
use tracing::info;
use vend_core::protocol::PROVISIONING_FRAME_LEN;
use vend_core::{encode_provisioning, EncodeError, Opcode};

use crate::application::transport::{write_with_retry, FrameChannel, TransportError, WritePolicy};

/// Errors from a provisioning call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("cannot encode {opcode}: {source}")]
    Encode {
        opcode: Opcode,
        #[source]
        source: EncodeError,
    },

    #[error("writing {opcode} failed: {source}")]
    Write {
        opcode: Opcode,
        #[source]
        source: TransportError,
    },
}

/// Writes provisioning frames to one freshly connected controller.
pub struct ProvisioningWriter {
    channel: Box<dyn FrameChannel>,
    policy: WritePolicy,
}

impl ProvisioningWriter {
    pub fn new(channel: Box<dyn FrameChannel>, policy: WritePolicy) -> Self {
        Self { channel, policy }
    }

    /// Writes `SET_SUBDOMAIN(site_alias)` then `SET_PASSKEY(passkey)`.
    ///
    /// # Errors
    ///
    /// [`ProvisioningError::Encode`] if either value is too long, or
    /// [`ProvisioningError::Write`] naming the frame that failed.
    pub async fn register(&self, site_alias: &str, passkey: &str) -> Result<(), ProvisioningError> {
        self.write_pair(
            (Opcode::SetSubdomain, site_alias),
            (Opcode::SetPasskey, passkey),
        )
        .await?;
        info!(site_alias, peer = %self.channel.peer().address, "controller registered");
        Ok(())
    }

    /// Writes `SET_WIFI_SSID(ssid)` then `SET_WIFI_PASSWORD(password)`.
    ///
    /// # Errors
    ///
    /// As for [`register`](Self::register).
    pub async fn configure_wifi(&self, ssid: &str, password: &str) -> Result<(), ProvisioningError> {
        self.write_pair(
            (Opcode::SetWifiSsid, ssid),
            (Opcode::SetWifiPassword, password),
        )
        .await?;
        info!(ssid, peer = %self.channel.peer().address, "wifi credentials written");
        Ok(())
    }

    /// Releases the connection.
    pub async fn disconnect(self) -> Result<(), TransportError> {
        self.channel.disconnect().await
    }

    async fn write_pair(
        &self,
        first: (Opcode, &str),
        second: (Opcode, &str),
    ) -> Result<(), ProvisioningError> {
        let frames = [encode(first)?, encode(second)?];
        let mut budget = self.policy.budget();

        for (opcode, frame) in [first.0, second.0].into_iter().zip(frames.iter()) {
            write_with_retry(self.channel.as_ref(), frame, &mut budget)
                .await
                .map_err(|source| ProvisioningError::Write { opcode, source })?;
        }
        Ok(())
    }
}

fn encode((opcode, text): (Opcode, &str)) -> Result<[u8; PROVISIONING_FRAME_LEN], ProvisioningError> {
    encode_provisioning(opcode, text).map_err(|source| ProvisioningError::Encode { opcode, source })
}
