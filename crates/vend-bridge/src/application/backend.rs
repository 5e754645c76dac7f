//! Shared vocabulary for authenticated backend calls.
//!
//! Every backend port (credit relay, remote credit, device directory) returns
//! [`BackendError`] and is driven through [`with_credential_retry`], which
//! applies the one-refresh-per-call rule.

use std::future::Future;

use thiserror::Error;
use tracing::warn;

use crate::application::auth::{AccessToken, AuthError, AuthTokenManager};

/// Failure of a single backend request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend refused the bearer credential (HTTP 401).
    #[error("credential expired or rejected")]
    Unauthorized,

    /// Any other non-success status.
    #[error("backend returned status {status}")]
    Status { status: u16, body: String },

    /// No response was received.
    #[error("backend unreachable: {0}")]
    Transport(String),

    /// The response body could not be understood.
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

/// Either the credential owner or the backend call failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Backend(BackendError),
}

/// Runs `call` with a valid token, refreshing and retrying once on expiry.
///
/// 1. Call with the current token.
/// 2. On [`BackendError::Unauthorized`], report the token, obtain a fresh one
///    and call once more.
/// 3. If that is rejected too, report it again (which refreshes the credential
///    for the next caller) and fail with [`AuthError::CredentialRejected`].
///
/// The refresh endpoint is therefore hit at most twice per call, once per
/// rejection, and the call itself at most twice.  Other failures are returned
/// as-is and never retried here.
///
/// # Errors
///
/// [`CallError::Auth`] for credential problems, [`CallError::Backend`] for
/// everything else.
pub async fn with_credential_retry<T, F, Fut>(
    auth: &AuthTokenManager,
    mut call: F,
) -> Result<T, CallError>
where
    F: FnMut(AccessToken) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let token = auth.get_valid_token().await?;
    match call(token.clone()).await {
        Err(BackendError::Unauthorized) => {}
        other => return other.map_err(CallError::Backend),
    }

    warn!("backend rejected the access token; refreshing once");
    auth.mark_rejected(&token).await;
    let token = auth.get_valid_token().await?;
    match call(token.clone()).await {
        Err(BackendError::Unauthorized) => {
            warn!("backend rejected the refreshed token");
            auth.mark_rejected(&token).await;
            auth.get_valid_token().await?;
            Err(CallError::Auth(AuthError::CredentialRejected))
        }
        other => other.map_err(CallError::Backend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::auth::{TokenPair, TokenRefresher};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct SequentialRefresher(AtomicU32);

    #[async_trait]
    impl TokenRefresher for SequentialRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair, AuthError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenPair {
                access_token: format!("t{n}"),
                refresh_token: "r".into(),
            })
        }
    }

    fn manager() -> (AuthTokenManager, Arc<SequentialRefresher>) {
        let refresher = Arc::new(SequentialRefresher(AtomicU32::new(0)));
        let auth = AuthTokenManager::new(
            TokenPair {
                access_token: "t0".into(),
                refresh_token: "r".into(),
            },
            refresher.clone(),
        );
        (auth, refresher)
    }

    #[tokio::test]
    async fn test_success_uses_current_token_once() {
        let (auth, refresher) = manager();
        let seen = Mutex::new(Vec::new());

        let result = with_credential_retry(&auth, |token| {
            seen.lock().unwrap().push(token.as_str().to_string());
            async { Ok::<_, BackendError>(7) }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(*seen.lock().unwrap(), vec!["t0"]);
        assert_eq!(refresher.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let (auth, _) = manager();
        let mut calls = 0;

        let result: Result<(), _> = with_credential_retry(&auth, |_| {
            calls += 1;
            async {
                Err(BackendError::Status {
                    status: 503,
                    body: String::new(),
                })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(CallError::Backend(BackendError::Status { status: 503, .. }))
        ));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_second_attempt_uses_refreshed_token() {
        let (auth, _) = manager();
        let seen = Mutex::new(Vec::new());

        let result = with_credential_retry(&auth, |token| {
            let first = seen.lock().unwrap().is_empty();
            seen.lock().unwrap().push(token.as_str().to_string());
            async move {
                if first {
                    Err(BackendError::Unauthorized)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(*seen.lock().unwrap(), vec!["t0", "t1"]);
    }
}
