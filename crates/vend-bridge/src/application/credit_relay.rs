//! Credit relay: trades a controller's vend request for a backend authorization.
//!
//! The controller's `VEND_REQUEST` frame is opaque to the bridge.  It is
//! base64-encoded, sent to the backend together with the site identifier
//! (and optionally where the phone is), and the backend answers with an
//! authorization blob that is base64-decoded and written back to the
//! controller verbatim.
//!
//! The same client also carries the remote-credit call, which credits a
//! machine through the backend without any Bluetooth session.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use vend_core::SiteId;

use crate::application::auth::{AccessToken, AuthError, AuthTokenManager};
use crate::application::backend::{with_credential_retry, BackendError, CallError};

// ── Wire bodies ───────────────────────────────────────────────────────────────

/// `POST request-credit` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditRequestBody {
    /// Base64 of the controller's raw request frame.
    pub payload: String,
    pub subdomain: SiteId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
}

/// `POST request-credit` reply.  An empty object means the backend refused
/// the request payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditReplyBody {
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default, alias = "sales_id")]
    pub sale_id: Option<serde_json::Value>,
}

/// `POST send-credit` body.  `amount` is in cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCreditBody {
    pub amount: u32,
    pub subdomain: SiteId,
}

// ── Domain-facing types ───────────────────────────────────────────────────────

/// The controller's vend request, exactly as it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest(pub Vec<u8>);

/// The backend's answer to a [`CreditRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditAuthorization {
    /// Bytes to write to the controller.
    pub payload: Vec<u8>,
    /// Backend sale record, when it reports one.
    pub sale_id: Option<String>,
}

/// Where the phone was when the sale happened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoLocation {
    pub lat: f64,
    pub lng: f64,
}

/// Errors from one relay call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("backend returned status {status}")]
    Status { status: u16 },

    #[error("backend unreachable: {0}")]
    Transport(String),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    /// The backend answered but issued no authorization.
    #[error("backend declined the vend request")]
    Declined,
}

impl From<CallError> for RelayError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Auth(e) => RelayError::Auth(e),
            CallError::Backend(BackendError::Unauthorized) => RelayError::Status { status: 401 },
            CallError::Backend(BackendError::Status { status, .. }) => RelayError::Status { status },
            CallError::Backend(BackendError::Transport(msg)) => RelayError::Transport(msg),
            CallError::Backend(BackendError::Malformed(msg)) => RelayError::MalformedResponse(msg),
        }
    }
}

// ── Backend port ──────────────────────────────────────────────────────────────

/// The credit endpoints of the backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreditBackend: Send + Sync {
    async fn request_credit(
        &self,
        token: &AccessToken,
        body: &CreditRequestBody,
    ) -> Result<CreditReplyBody, BackendError>;

    async fn send_credit(
        &self,
        token: &AccessToken,
        body: &SendCreditBody,
    ) -> Result<(), BackendError>;
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Relays credit requests using the shared credential owner.
#[derive(Clone)]
pub struct CreditRelayClient {
    backend: Arc<dyn CreditBackend>,
    auth: AuthTokenManager,
}

impl CreditRelayClient {
    pub fn new(backend: Arc<dyn CreditBackend>, auth: AuthTokenManager) -> Self {
        Self { backend, auth }
    }

    /// Exchanges `request` for an authorization from the backend.
    ///
    /// Credential expiry is recovered from once; see
    /// [`with_credential_retry`].
    ///
    /// # Errors
    ///
    /// - [`RelayError::Auth`] if the credential cannot be refreshed or is
    ///   rejected twice.
    /// - [`RelayError::Status`] for any other non-success status.
    /// - [`RelayError::Transport`] if the backend could not be reached.
    /// - [`RelayError::Declined`] if the backend returned no payload.
    /// - [`RelayError::MalformedResponse`] if the payload is not base64.
    pub async fn request_authorization(
        &self,
        site_id: SiteId,
        request: &CreditRequest,
        location: Option<GeoLocation>,
    ) -> Result<CreditAuthorization, RelayError> {
        let body = CreditRequestBody {
            payload: BASE64.encode(&request.0),
            subdomain: site_id,
            lat: location.map(|l| l.lat),
            lng: location.map(|l| l.lng),
        };

        let backend = self.backend.as_ref();
        let body = &body;
        let reply = with_credential_retry(&self.auth, |token| async move {
            backend.request_credit(&token, body).await
        })
        .await?;

        let authorization = decode_reply(reply)?;
        info!(
            site_id = %site_id,
            sale_id = authorization.sale_id.as_deref().unwrap_or("-"),
            "vend request authorized"
        );
        Ok(authorization)
    }

    /// Credits `amount_cents` to the machine at `site_id` through the backend.
    ///
    /// # Errors
    ///
    /// Same as [`request_authorization`](Self::request_authorization), minus
    /// the payload-related variants.
    pub async fn send_remote_credit(
        &self,
        site_id: SiteId,
        amount_cents: u32,
    ) -> Result<(), RelayError> {
        let body = SendCreditBody {
            amount: amount_cents,
            subdomain: site_id,
        };

        let backend = self.backend.as_ref();
        let body = &body;
        with_credential_retry(&self.auth, |token| async move {
            backend.send_credit(&token, body).await
        })
        .await?;

        info!(site_id = %site_id, amount_cents, "remote credit sent");
        Ok(())
    }
}

fn decode_reply(reply: CreditReplyBody) -> Result<CreditAuthorization, RelayError> {
    let Some(encoded) = reply.payload else {
        warn!("backend reply carried no payload");
        return Err(RelayError::Declined);
    };

    let payload = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| RelayError::MalformedResponse(format!("payload is not base64: {e}")))?;

    let sale_id = reply.sale_id.map(|v| match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    });

    Ok(CreditAuthorization { payload, sale_id })
}
