//! HTTP adapter for the credit backend.
//!
//! [`HttpBackend`] implements every backend-facing port of the application
//! layer over one `reqwest` client:
//!
//! | Port                 | Endpoint (configurable path)        |
//! |----------------------|-------------------------------------|
//! | [`CreditBackend`]    | `POST request-credit`, `POST send-credit` |
//! | [`TokenRefresher`]   | `POST token/refresh`                |
//! | [`CredentialIssuer`] | `POST token/login`                  |
//! | [`DeviceDirectory`]  | `POST devices`                      |
//!
//! All bodies are JSON.  Authenticated calls carry the access token as a
//! bearer credential, and every call carries the optional `apikey` header
//! some hosted backends require.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::application::auth::{
    AccessToken, AuthError, CredentialIssuer, TokenPair, TokenRefresher,
};
use crate::application::backend::BackendError;
use crate::application::credit_relay::{
    CreditBackend, CreditReplyBody, CreditRequestBody, SendCreditBody,
};
use crate::application::enroll::{DeviceDirectory, DeviceRecord};
use crate::infrastructure::storage::config::BackendConfig;

const USER_AGENT: &str = concat!("vend-bridge/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept for diagnostics.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct CreateDeviceBody<'a> {
    mac: &'a str,
}

/// Reply to a device insert: row-returning backends answer with the inserted
/// rows, others with the bare record.
#[derive(Deserialize)]
#[serde(untagged)]
enum CreateDeviceReply {
    Rows(Vec<DeviceRecord>),
    Record(DeviceRecord),
}

impl CreateDeviceReply {
    fn into_record(self) -> Result<DeviceRecord, BackendError> {
        match self {
            CreateDeviceReply::Record(record) => Ok(record),
            CreateDeviceReply::Rows(rows) => rows
                .into_iter()
                .next()
                .ok_or_else(|| BackendError::Malformed("device insert returned no rows".into())),
        }
    }
}

/// `reqwest`-backed implementation of the backend ports.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    config: BackendConfig,
}

impl HttpBackend {
    /// Builds the HTTP client described by `config`.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the TLS backend cannot be initialised.
    pub fn new(config: BackendConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { http, config })
    }

    fn post(&self, path: &str, token: Option<&AccessToken>) -> RequestBuilder {
        let url = join_url(&self.config.base_url, path);
        debug!(%url, "backend request");
        let mut request = self.http.post(url);
        if let Some(key) = &self.config.api_key {
            request = request.header("apikey", key);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token.as_str());
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }

    async fn send_json<R: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<R, BackendError> {
        self.send(request)
            .await?
            .json::<R>()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))
    }

    fn login_request(&self, email: &str, password: &str) -> RequestBuilder {
        self.post(&self.config.login_path, None)
            .json(&LoginBody { email, password })
    }

    fn create_device_request(&self, token: &AccessToken, mac: &str) -> RequestBuilder {
        self.post(&self.config.devices_path, Some(token))
            .header("Prefer", "return=representation")
            .json(&CreateDeviceBody { mac })
    }
}

#[async_trait]
impl CreditBackend for HttpBackend {
    async fn request_credit(
        &self,
        token: &AccessToken,
        body: &CreditRequestBody,
    ) -> Result<CreditReplyBody, BackendError> {
        self.send_json(self.post(&self.config.request_credit_path, Some(token)).json(body))
            .await
    }

    async fn send_credit(
        &self,
        token: &AccessToken,
        body: &SendCreditBody,
    ) -> Result<(), BackendError> {
        self.send(self.post(&self.config.send_credit_path, Some(token)).json(body))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl TokenRefresher for HttpBackend {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let request = self
            .post(&self.config.refresh_path, None)
            .json(&RefreshBody { refresh_token });
        self.send_json(request)
            .await
            .map_err(|e| {
                warn!(error = %e, "token refresh rejected");
                AuthError::RefreshFailed(e.to_string())
            })
    }
}

#[async_trait]
impl DeviceDirectory for HttpBackend {
    async fn create_device(
        &self,
        token: &AccessToken,
        mac: &str,
    ) -> Result<DeviceRecord, BackendError> {
        self.send_json::<CreateDeviceReply>(self.create_device_request(token, mac))
            .await?
            .into_record()
    }
}

#[async_trait]
impl CredentialIssuer for HttpBackend {
    async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        self.send_json(self.login_request(email, password)).await.map_err(|e| {
            warn!(error = %e, "sign-in rejected");
            AuthError::LoginFailed(e.to_string())
        })
    }
}

/// Joins a base URL and an endpoint path with exactly one `/` between them.
fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Maps a non-success status to the error the retry logic understands.
fn status_error(status: u16, mut body: String) -> BackendError {
    if status == 401 {
        return BackendError::Unauthorized;
    }
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    BackendError::Status { status, body }
}
