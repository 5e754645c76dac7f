//! Enrolling a factory-fresh controller.
//!
//! A controller that still advertises site `0` is unknown to the backend.
//! Enrolment asks the backend to create a device record for its address,
//! which yields the site identifier and passkey, and then registers the
//! controller with them over a fresh connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use vend_core::domain::device::first_unprovisioned;
use vend_core::{AliasError, Device, SiteId};

use crate::application::auth::{AccessToken, AuthTokenManager};
use crate::application::backend::{with_credential_retry, BackendError, CallError};
use crate::application::provisioning::{ProvisioningError, ProvisioningWriter};
use crate::application::transport::{Transport, TransportError, WritePolicy};

/// A device record created by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(alias = "domain")]
    pub subdomain: SiteId,
    #[serde(alias = "vernam")]
    pub passkey: String,
}

/// The device-inventory endpoint of the backend.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Creates a record for the controller at `mac`.
    async fn create_device(
        &self,
        token: &AccessToken,
        mac: &str,
    ) -> Result<DeviceRecord, BackendError>;
}

/// Errors from enrolment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrollError {
    #[error("peer is not a controller: {0}")]
    NotAController(#[from] AliasError),

    #[error("controller is already registered as site {0}")]
    AlreadyProvisioned(SiteId),

    #[error("device record request failed: {0}")]
    Backend(#[from] CallError),

    #[error("no peer at {0} in range")]
    PeerNotFound(String),

    #[error("no unprovisioned controller in range")]
    NoneWaiting,

    #[error("backend assigned the reserved site id 0")]
    InvalidAssignment,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
}

/// Scans for the controller to provision: the peer at `address` if given,
/// otherwise the first one still on site `0`.
///
/// # Errors
///
/// A named peer that is absent, is not a controller, or is already
/// registered is refused, so a live site is never re-provisioned.
pub async fn find_unprovisioned(
    transport: &dyn Transport,
    alias_suffix: &str,
    scan_timeout: Duration,
    address: Option<&str>,
) -> Result<Device, EnrollError> {
    let peers = transport.scan(scan_timeout).await?;
    let Some(address) = address else {
        return first_unprovisioned(peers, alias_suffix).ok_or(EnrollError::NoneWaiting);
    };

    let device = peers
        .into_iter()
        .find(|d| d.address == address)
        .ok_or_else(|| EnrollError::PeerNotFound(address.to_string()))?;
    let site_id = device.site_id(alias_suffix)?;
    if !site_id.is_unprovisioned() {
        return Err(EnrollError::AlreadyProvisioned(site_id));
    }
    Ok(device)
}

/// The enrolment use case.
pub struct EnrollDevice {
    directory: Arc<dyn DeviceDirectory>,
    auth: AuthTokenManager,
    policy: WritePolicy,
    alias_suffix: String,
}

impl EnrollDevice {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        auth: AuthTokenManager,
        policy: WritePolicy,
        alias_suffix: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            auth,
            policy,
            alias_suffix: alias_suffix.into(),
        }
    }

    /// Creates a backend record for `device` and registers the controller with it.
    ///
    /// Returns the assigned site identifier.
    ///
    /// # Errors
    ///
    /// See [`EnrollError`].  Nothing is written to the controller unless the
    /// backend produced a usable record.
    pub async fn enroll(
        &self,
        transport: &dyn Transport,
        device: &Device,
    ) -> Result<SiteId, EnrollError> {
        let current = device.site_id(&self.alias_suffix)?;
        if !current.is_unprovisioned() {
            return Err(EnrollError::AlreadyProvisioned(current));
        }

        let directory = self.directory.as_ref();
        let mac = device.address.as_str();
        let record = with_credential_retry(&self.auth, |token| async move {
            directory.create_device(&token, mac).await
        })
        .await?;
        if record.subdomain.is_unprovisioned() {
            return Err(EnrollError::InvalidAssignment);
        }

        let channel = transport.connect(device).await?;
        let writer = ProvisioningWriter::new(channel, self.policy);
        let registered = writer
            .register(&record.subdomain.site_alias(), &record.passkey)
            .await;
        if let Err(e) = writer.disconnect().await {
            warn!(error = %e, "disconnect after enrolment failed");
        }
        registered?;

        info!(site_id = %record.subdomain, peer = %device.address, "controller enrolled");
        Ok(record.subdomain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_record_accepts_backend_field_names() {
        let record: DeviceRecord =
            serde_json::from_str(r#"{"domain": 42, "vernam": "k3y"}"#).unwrap();

        assert_eq!(
            record,
            DeviceRecord {
                subdomain: SiteId(42),
                passkey: "k3y".into()
            }
        );
    }

    #[test]
    fn test_device_record_accepts_canonical_field_names() {
        let record: DeviceRecord =
            serde_json::from_str(r#"{"subdomain": 7, "passkey": "p"}"#).unwrap();

        assert_eq!(record.subdomain, SiteId(7));
    }
}
