//! Bearer credential ownership with single-flighted refresh.
//!
//! [`AuthTokenManager`] is the only place the access/refresh token pair
//! lives.  It is cheap to clone (all clones share one state) and safe to use
//! from many sessions at once.
//!
//! # Refresh rules
//!
//! - `get_valid_token` returns the current access token while the status is
//!   `Valid`.
//! - After `mark_expired`, the next `get_valid_token` starts exactly one
//!   refresh.  Callers arriving while it runs wait for the same outcome.
//! - The refresh runs on its own task, so a waiter that gives up does not
//!   abort it for everyone else.
//! - A failed refresh is reported to every waiter and is *not* retried on the
//!   next call: the status stays invalid but disarmed until `mark_expired` is
//!   called again.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Errors surfaced by the credential owner.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The refresh token was refused or the refresh endpoint was unreachable.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Email/password sign-in was refused or the endpoint was unreachable.
    #[error("sign-in failed: {0}")]
    LoginFailed(String),

    /// The backend kept rejecting the credential after a refresh.
    #[error("credential rejected by the backend after refresh")]
    CredentialRejected,
}

/// A bearer access token.  Its value never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Access and refresh token as exchanged with the backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Exchanges a refresh token for a new pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError>;
}

/// Exchanges account credentials for the first token pair.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError>;
}

/// Observable credential status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    Refreshing,
    Invalid,
}

type RefreshOutcome = Option<Result<AccessToken, AuthError>>;

enum Status {
    Valid,
    Refreshing(watch::Receiver<RefreshOutcome>),
    /// `armed` is false after a failed refresh: no new attempt until `mark_expired`.
    Invalid { armed: bool, last_error: Option<AuthError> },
}

struct State {
    tokens: TokenPair,
    status: Status,
}

struct Inner {
    refresher: Arc<dyn TokenRefresher>,
    state: Mutex<State>,
}

/// Shared owner of the bearer credential pair.
#[derive(Clone)]
pub struct AuthTokenManager {
    inner: Arc<Inner>,
}

impl AuthTokenManager {
    /// Starts from a known-good token pair.
    pub fn new(tokens: TokenPair, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::with_status(tokens, Status::Valid, refresher)
    }

    /// Starts with only a refresh token; the first caller triggers a refresh.
    pub fn from_refresh_token(
        refresh_token: impl Into<String>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let tokens = TokenPair {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
        };
        let status = Status::Invalid {
            armed: true,
            last_error: None,
        };
        Self::with_status(tokens, status, refresher)
    }

    /// Signs in with account credentials and starts from the issued pair.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LoginFailed`] (or whatever the issuer reports) if
    /// no pair was issued.
    pub async fn sign_in(
        issuer: &dyn CredentialIssuer,
        email: &str,
        password: &str,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self, AuthError> {
        let tokens = issuer.login(email, password).await?;
        info!("signed in");
        Ok(Self::new(tokens, refresher))
    }

    fn with_status(tokens: TokenPair, status: Status, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                refresher,
                state: Mutex::new(State { tokens, status }),
            }),
        }
    }

    pub async fn status(&self) -> TokenStatus {
        match self.inner.state.lock().await.status {
            Status::Valid => TokenStatus::Valid,
            Status::Refreshing(_) => TokenStatus::Refreshing,
            Status::Invalid { .. } => TokenStatus::Invalid,
        }
    }

    /// Returns a usable access token, refreshing first if the current one expired.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RefreshFailed`] if the refresh this call started or
    /// joined failed, or if the last refresh failed and nothing re-armed it.
    pub async fn get_valid_token(&self) -> Result<AccessToken, AuthError> {
        let mut outcome = {
            let mut state = self.inner.state.lock().await;
            let in_flight = match &state.status {
                Status::Valid => return Ok(AccessToken::new(state.tokens.access_token.clone())),
                Status::Invalid {
                    armed: false,
                    last_error,
                } => {
                    return Err(last_error.clone().unwrap_or_else(|| {
                        AuthError::RefreshFailed("credential expired".to_string())
                    }))
                }
                Status::Refreshing(rx) => Some(rx.clone()),
                Status::Invalid { armed: true, .. } => None,
            };
            match in_flight {
                Some(rx) => {
                    debug!("joining in-flight token refresh");
                    rx
                }
                None => self.start_refresh(&mut state),
            }
        };

        let result = match outcome.wait_for(|o| o.is_some()).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(AuthError::RefreshFailed(
                "refresh task ended without a result".to_string(),
            ))
        })
    }

    /// Records that the backend rejected the current access token.
    ///
    /// Does nothing while a refresh is already in flight.
    pub async fn mark_expired(&self) {
        let mut state = self.inner.state.lock().await;
        if matches!(state.status, Status::Refreshing(_)) {
            debug!("token already refreshing; expiry ignored");
            return;
        }
        state.status = Status::Invalid {
            armed: true,
            last_error: None,
        };
    }

    /// Like [`mark_expired`](Self::mark_expired), but only if `rejected` is
    /// still the current token.  A rejection of a token that another caller
    /// already replaced is ignored.
    pub async fn mark_rejected(&self, rejected: &AccessToken) {
        {
            let state = self.inner.state.lock().await;
            if matches!(state.status, Status::Valid)
                && state.tokens.access_token != rejected.as_str()
            {
                debug!("rejected token was already replaced");
                return;
            }
        }
        self.mark_expired().await;
    }

    fn start_refresh(&self, state: &mut State) -> watch::Receiver<RefreshOutcome> {
        let (tx, rx) = watch::channel(None);
        state.status = Status::Refreshing(rx.clone());
        let refresh_token = state.tokens.refresh_token.clone();
        let inner = Arc::clone(&self.inner);

        info!("refreshing access token");
        tokio::spawn(async move {
            let result = inner.refresher.refresh(&refresh_token).await;

            let outcome = {
                let mut state = inner.state.lock().await;
                match result {
                    Ok(tokens) => {
                        let access = AccessToken::new(tokens.access_token.clone());
                        state.tokens = tokens;
                        state.status = Status::Valid;
                        info!("access token refreshed");
                        Ok(access)
                    }
                    Err(e) => {
                        warn!(error = %e, "token refresh failed");
                        state.status = Status::Invalid {
                            armed: false,
                            last_error: Some(e.clone()),
                        };
                        Err(e)
                    }
                }
            };
            // Waiters may all have gone away; the state above is already updated.
            let _ = tx.send(Some(outcome));
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Counts refresh calls; optionally holds each one until released.
    struct CountingRefresher {
        calls: AtomicU32,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    impl CountingRefresher {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                gate: None,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                gate: None,
                fail: true,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                gate: Some(gate),
                fail: false,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(AuthError::RefreshFailed("invalid refresh token".into()));
            }
            Ok(TokenPair {
                access_token: format!("access-{n}"),
                refresh_token: format!("{refresh_token}+"),
            })
        }
    }

    fn pair(access: &str) -> TokenPair {
        TokenPair {
            access_token: access.into(),
            refresh_token: "refresh".into(),
        }
    }

    #[tokio::test]
    async fn test_valid_token_is_returned_without_refresh() {
        let refresher = CountingRefresher::ok();
        let auth = AuthTokenManager::new(pair("access-0"), refresher.clone());

        let token = auth.get_valid_token().await.unwrap();

        assert_eq!(token.as_str(), "access-0");
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_mark_expired_triggers_exactly_one_refresh() {
        let refresher = CountingRefresher::ok();
        let auth = AuthTokenManager::new(pair("access-0"), refresher.clone());

        auth.mark_expired().await;
        let first = auth.get_valid_token().await.unwrap();
        let second = auth.get_valid_token().await.unwrap();

        assert_eq!(first.as_str(), "access-1");
        assert_eq!(second.as_str(), "access-1");
        assert_eq!(refresher.calls(), 1);
        assert_eq!(auth.status().await, TokenStatus::Valid);
    }

    #[tokio::test]
    async fn test_from_refresh_token_refreshes_on_first_use() {
        let refresher = CountingRefresher::ok();
        let auth = AuthTokenManager::from_refresh_token("refresh", refresher.clone());

        assert_eq!(auth.status().await, TokenStatus::Invalid);
        let token = auth.get_valid_token().await.unwrap();

        assert_eq!(token.as_str(), "access-1");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        // Arrange
        let gate = Arc::new(Notify::new());
        let refresher = CountingRefresher::gated(gate.clone());
        let auth = AuthTokenManager::new(pair("stale"), refresher.clone());
        auth.mark_expired().await;

        // Act: five callers pile up behind the held refresh
        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move { auth.get_valid_token().await })
            })
            .collect();
        while auth.status().await != TokenStatus::Refreshing {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        // Assert
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().as_str(), "access-1");
        }
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_mark_expired_during_refresh_is_ignored() {
        let gate = Arc::new(Notify::new());
        let refresher = CountingRefresher::gated(gate.clone());
        let auth = AuthTokenManager::new(pair("stale"), refresher.clone());
        auth.mark_expired().await;

        let pending = {
            let auth = auth.clone();
            tokio::spawn(async move { auth.get_valid_token().await })
        };
        while auth.status().await != TokenStatus::Refreshing {
            tokio::task::yield_now().await;
        }
        auth.mark_expired().await;
        assert_eq!(auth.status().await, TokenStatus::Refreshing);
        gate.notify_one();

        pending.await.unwrap().unwrap();
        assert_eq!(auth.get_valid_token().await.unwrap().as_str(), "access-1");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_reaches_every_waiter_and_is_not_repeated() {
        let refresher = CountingRefresher::failing();
        let auth = AuthTokenManager::new(pair("stale"), refresher.clone());
        auth.mark_expired().await;

        let first = auth.get_valid_token().await;
        let second = auth.get_valid_token().await;

        assert!(matches!(first, Err(AuthError::RefreshFailed(_))));
        assert_eq!(first, second);
        assert_eq!(refresher.calls(), 1, "no second attempt without a new expiry");
        assert_eq!(auth.status().await, TokenStatus::Invalid);
    }

    #[tokio::test]
    async fn test_mark_expired_rearms_after_failure() {
        let refresher = CountingRefresher::failing();
        let auth = AuthTokenManager::new(pair("stale"), refresher.clone());

        auth.mark_expired().await;
        let _ = auth.get_valid_token().await;
        auth.mark_expired().await;
        let _ = auth.get_valid_token().await;

        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_mark_rejected_ignores_replaced_token() {
        let refresher = CountingRefresher::ok();
        let auth = AuthTokenManager::new(pair("access-0"), refresher.clone());
        let old = auth.get_valid_token().await.unwrap();
        auth.mark_rejected(&old).await;
        let fresh = auth.get_valid_token().await.unwrap();

        // a second caller still holding the old token reports it late
        auth.mark_rejected(&old).await;

        assert_eq!(auth.get_valid_token().await.unwrap(), fresh);
        assert_eq!(refresher.calls(), 1);
    }

    /// Issues `issued-access`/`issued-refresh` for one known account.
    struct StubIssuer;

    #[async_trait]
    impl CredentialIssuer for StubIssuer {
        async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
            if (email, password) != ("owner@example.com", "correct horse") {
                return Err(AuthError::LoginFailed("invalid login credentials".into()));
            }
            Ok(TokenPair {
                access_token: "issued-access".into(),
                refresh_token: "issued-refresh".into(),
            })
        }
    }

    /// Echoes the refresh token it was given back as the new access token.
    struct EchoRefresher;

    #[async_trait]
    impl TokenRefresher for EchoRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
            Ok(TokenPair {
                access_token: format!("from-{refresh_token}"),
                refresh_token: refresh_token.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_sign_in_seeds_manager_with_issued_pair() {
        let auth = AuthTokenManager::sign_in(
            &StubIssuer,
            "owner@example.com",
            "correct horse",
            CountingRefresher::ok(),
        )
        .await
        .unwrap();

        assert_eq!(auth.status().await, TokenStatus::Valid);
        assert_eq!(auth.get_valid_token().await.unwrap().as_str(), "issued-access");
    }

    #[tokio::test]
    async fn test_sign_in_hands_issued_refresh_token_to_refresher() {
        let auth = AuthTokenManager::sign_in(
            &StubIssuer,
            "owner@example.com",
            "correct horse",
            Arc::new(EchoRefresher),
        )
        .await
        .unwrap();

        auth.mark_expired().await;

        assert_eq!(
            auth.get_valid_token().await.unwrap().as_str(),
            "from-issued-refresh"
        );
    }

    #[tokio::test]
    async fn test_sign_in_with_wrong_password_fails() {
        let result = AuthTokenManager::sign_in(
            &StubIssuer,
            "owner@example.com",
            "wrong",
            CountingRefresher::ok(),
        )
        .await;

        assert_eq!(
            result.err(),
            Some(AuthError::LoginFailed("invalid login credentials".into()))
        );
    }

    #[test]
    fn test_debug_output_redacts_tokens() {
        let token = AccessToken::new("secret-value");
        let pair = pair("secret-value");

        assert!(!format!("{token:?}").contains("secret"));
        assert!(!format!("{pair:?}").contains("secret"));
    }
}
