//! Refresh-grant exchanges and their failure classification
//!
//! Every refresh attempt ends in exactly one of three ways:
//!
//! * success, yielding new [`TokenFields`];
//! * a terminal rejection of the refresh token (HTTP 400 or 401), which is
//!   never retried and requires the subject to re-authorize;
//! * a transient failure (transport error, timeout, any other status),
//!   which is retried with exponential backoff until the attempt budget is
//!   spent.

use std::{error, future::Future};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    backends::BoxError,
    backoff::{RetryPolicy, WithBackoff},
    record::TokenFields,
    RefreshTokenRef,
};

#[cfg(feature = "oauth2")]
pub mod oauth2;

/// A failure that may succeed if tried again
#[derive(Debug, Error)]
pub enum TransientError {
    /// The request could not be sent or the response could not be read
    #[error("unable to reach the token endpoint")]
    Transport(#[source] BoxError),
    /// The provider answered with a status that is neither success nor rejection
    #[error("unexpected status {status} from the token endpoint")]
    UnexpectedStatus {
        /// The HTTP status code
        status: u16,
        /// The response body
        body: String,
    },
    /// The provider answered with success, but the body could not be parsed
    #[error("malformed token response")]
    MalformedBody(#[from] serde_json::Error),
}

/// The outcome of a failed refresh
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The provider rejected the refresh token; re-authorization is required
    #[error("refresh token rejected by provider with status {status}")]
    InvalidGrant {
        /// The HTTP status code
        status: u16,
        /// The response body
        body: String,
    },
    /// Every permitted attempt failed transiently
    #[error("token refresh failed after {attempts} attempts")]
    Exhausted {
        /// The number of attempts made
        attempts: u32,
        /// The failure of the final attempt
        #[source]
        last: TransientError,
    },
    /// The record holds no refresh token
    #[error("no refresh token available")]
    MissingRefreshToken,
}

impl RefreshError {
    /// Whether the failure requires the subject to re-authorize
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidGrant { .. } | Self::MissingRefreshToken)
    }
}

/// The outcome of a single failed attempt
#[derive(Debug)]
pub enum AttemptError {
    /// The provider rejected the refresh token
    Rejected {
        /// The HTTP status code
        status: u16,
        /// The response body
        body: String,
    },
    /// The attempt may be retried
    Transient(TransientError),
}

impl From<TransientError> for AttemptError {
    fn from(err: TransientError) -> Self {
        Self::Transient(err)
    }
}

/// Exchanges a refresh token for new token fields
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Performs one refresh exchange, including any retries
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenFields, RefreshError>;
}

/// Runs `attempt` until it succeeds, is rejected, or the policy's attempt
/// budget is spent
///
/// The n-th failed attempt is followed by the n-th backoff delay. A
/// rejection ends the loop immediately.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, RefreshError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut backoff = policy.handler();
    let mut made = 0;

    loop {
        made += 1;
        match attempt(made).await.with_backoff(&mut backoff) {
            Ok(value) => return Ok(value),
            Err((AttemptError::Rejected { status, body }, _)) => {
                tracing::debug!(status, "refresh token rejected; not retrying");
                return Err(RefreshError::InvalidGrant { status, body });
            }
            Err((AttemptError::Transient(last), _)) if made >= policy.max_attempts() => {
                return Err(RefreshError::Exhausted {
                    attempts: made,
                    last,
                });
            }
            Err((AttemptError::Transient(error), delay)) => {
                tracing::warn!(
                    attempt = made,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = (&error as &dyn error::Error),
                    "token refresh attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::backoff::ErrorBackoffConfig;

    fn transient() -> AttemptError {
        AttemptError::Transient(TransientError::Transport(Box::new(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out",
        ))))
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, ErrorBackoffConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AttemptError::Rejected {
                    status: 401,
                    body: String::new(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(RefreshError::InvalidGrant { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_use_whole_budget() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = with_retries(&policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(matches!(result, Err(RefreshError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let result = with_retries(&policy(3), |attempt| async move {
            if attempt < 2 {
                Err(transient())
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn classification() {
        assert!(RefreshError::InvalidGrant {
            status: 400,
            body: String::new()
        }
        .is_terminal());
        assert!(RefreshError::MissingRefreshToken.is_terminal());
        assert!(!RefreshError::Exhausted {
            attempts: 3,
            last: TransientError::UnexpectedStatus {
                status: 503,
                body: String::new()
            }
        }
        .is_terminal());
    }
}
