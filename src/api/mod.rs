//! Remote conversation-platform API client.
//!
//! All endpoints speak a `{code, msg, data}` JSON envelope; `code == 0` is
//! success and any other code is a terminal business error that is never
//! retried. Retries apply only to transport failures (network, timeout) and
//! throttling/server statuses, with exponential backoff.
//!
//! Modules:
//! - token: access-token lifecycle (cache, persisted rows, scheduled refresh)
//! - conversations: paginated listing + two-step transcript retrieval
//! - org: user and department lookup with tolerated not-found
//! - source: trait seam over the remote API for testability

pub mod conversations;
pub mod org;
pub mod source;
pub mod token;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use token::TokenManager;

/// Timeout for ordinary API calls.
pub const REQUEST_TIMEOUT_SECS: u64 = 90;
/// Timeout for transcript content downloads, which can be large.
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Business code: transcription still in progress (terminal, never retried).
pub const CODE_TRANSCRIPT_NOT_READY: i64 = 501_200;
/// Business code: user not found (tolerated).
pub const CODE_USER_NOT_FOUND: i64 = 401_154;
/// Business code: department not found (tolerated).
pub const CODE_DEPARTMENT_NOT_FOUND: i64 = 401_103;

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("API business error {code}: {message}")]
    Business { code: i64, message: String },

    #[error("API response carried no data payload")]
    MissingData,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Database: {0}")]
    Db(#[from] crate::db::DbError),

    #[error("Request exhausted retries")]
    RetriesExhausted,
}

impl ApiError {
    /// The business code carried by this error, if it is a business error.
    pub fn business_code(&self) -> Option<i64> {
        match self {
            ApiError::Business { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// ============================================================================
// Response envelope
// ============================================================================

/// Standard remote envelope. `data` is absent on error responses.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Check HTTP status, then the business envelope, and return `data`.
pub(crate) async fn parse_envelope<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ApiError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            message: body,
        });
    }
    let envelope: Envelope<T> = resp.json().await?;
    if envelope.code != 0 {
        return Err(ApiError::Business {
            code: envelope.code,
            message: envelope.msg,
        });
    }
    envelope.data.ok_or(ApiError::MissingData)
}

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    NonRetryable,
}

/// Throttling, request timeout, and server errors are retryable; any other
/// status (including business 4xx) fails immediately.
pub(crate) fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

pub(crate) fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(hint) = retry_after {
        return hint.min(Duration::from_secs(30));
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// One attempt's verdict inside [`run_with_retry`].
pub(crate) enum Attempt<T> {
    /// Terminal success (or a terminal error the caller will classify).
    Done(T),
    /// Transient failure; retry after backoff (or the server's hint).
    Transient {
        error: ApiError,
        retry_after: Option<Duration>,
    },
    /// Non-retryable failure; surface immediately.
    Fatal(ApiError),
}

/// Drive `attempt` under the retry policy. The closure receives the 1-based
/// attempt number; `Transient` outcomes back off and retry until the policy
/// is exhausted.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt_no in 1..=attempts {
        match attempt(attempt_no).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(error) => return Err(error),
            Attempt::Transient { error, retry_after } => {
                if attempt_no < attempts {
                    let delay = retry_delay(attempt_no, policy, retry_after);
                    log::warn!(
                        "api retry {}/{} after {} (sleep {:?})",
                        attempt_no,
                        attempts,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or(ApiError::RetriesExhausted))
}

/// Send a request with retry on transport errors and retryable statuses.
///
/// Non-retryable statuses are returned as `Ok(response)` for the caller to
/// map; this mirrors the fact that business errors live in the envelope, not
/// the transport.
pub(crate) async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, ApiError> {
    // Streaming bodies can't be cloned for retry; send those once.
    if request.try_clone().is_none() {
        return request.send().await.map_err(ApiError::Http);
    }

    run_with_retry(policy, move |_| {
        let cloned = request.try_clone();
        async move {
            let Some(builder) = cloned else {
                return Attempt::Fatal(ApiError::RetriesExhausted);
            };
            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if retry_decision_for_status(status) == RetryDecision::Retryable {
                        let retry_after = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        Attempt::Transient {
                            error: ApiError::Status {
                                status: status.as_u16(),
                                message: status.to_string(),
                            },
                            retry_after,
                        }
                    } else {
                        Attempt::Done(response)
                    }
                }
                Err(err) => {
                    if err.is_timeout() || err.is_connect() {
                        Attempt::Transient {
                            error: ApiError::Http(err),
                            retry_after: None,
                        }
                    } else {
                        Attempt::Fatal(ApiError::Http(err))
                    }
                }
            }
        }
    })
    .await
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the conversation platform. Every outgoing call is
/// authorized with a token obtained from the [`TokenManager`] at send time.
pub struct ApiClient {
    http: reqwest::Client,
    download: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(base_url: &str, tokens: Arc<TokenManager>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let download = reqwest::Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            download,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            policy: RetryPolicy::default(),
        })
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) async fn bearer(&self) -> Result<String, ApiError> {
        self.tokens.get_access_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_retry_decision_for_status() {
        use reqwest::StatusCode;
        assert_eq!(
            retry_decision_for_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDecision::Retryable
        );
        assert_eq!(
            retry_decision_for_status(StatusCode::REQUEST_TIMEOUT),
            RetryDecision::Retryable
        );
        assert_eq!(
            retry_decision_for_status(StatusCode::BAD_GATEWAY),
            RetryDecision::Retryable
        );
        assert_eq!(
            retry_decision_for_status(StatusCode::NOT_FOUND),
            RetryDecision::NonRetryable
        );
        assert_eq!(
            retry_decision_for_status(StatusCode::BAD_REQUEST),
            RetryDecision::NonRetryable
        );
        assert_eq!(
            retry_decision_for_status(StatusCode::OK),
            RetryDecision::NonRetryable
        );
    }

    #[test]
    fn test_retry_delay_honors_hint() {
        let policy = RetryPolicy::default();
        let delay = retry_delay(1, &policy, Some(Duration::from_secs(7)));
        assert_eq!(delay, Duration::from_secs(7));
        // Hints are capped at 30 seconds.
        let delay = retry_delay(1, &policy, Some(Duration::from_secs(600)));
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn test_retry_delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        };
        let d1 = retry_delay(1, &policy, None).as_millis() as u64;
        let d3 = retry_delay(3, &policy, None).as_millis() as u64;
        assert!((100..100 + 150).contains(&d1));
        assert!((400..400 + 150).contains(&d3));
    }

    #[tokio::test]
    async fn test_two_transient_failures_then_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&fast_policy(10), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    Attempt::Transient {
                        error: ApiError::RetriesExhausted,
                        retry_after: None,
                    }
                } else {
                    Attempt::Done(n)
                }
            }
        })
        .await;

        // Two retries on top of the initial attempt.
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = run_with_retry(&fast_policy(10), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Attempt::Fatal(ApiError::Business {
                    code: CODE_TRANSCRIPT_NOT_READY,
                    message: "transcription in progress".to_string(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().business_code(), Some(CODE_TRANSCRIPT_NOT_READY));
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = run_with_retry(&fast_policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Attempt::Transient {
                    error: ApiError::Status {
                        status: 429,
                        message: "throttled".to_string(),
                    },
                    retry_after: None,
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(ApiError::Status { status: 429, .. })));
    }

    #[test]
    fn test_envelope_deserializes_success_and_error() {
        #[derive(Deserialize)]
        struct Payload {
            value: i32,
        }

        let ok: Envelope<Payload> =
            serde_json::from_str(r#"{"code":0,"msg":"","data":{"value":7}}"#).unwrap();
        assert_eq!(ok.code, 0);
        assert_eq!(ok.data.unwrap().value, 7);

        let err: Envelope<Payload> =
            serde_json::from_str(r#"{"code":501200,"msg":"in progress"}"#).unwrap();
        assert_eq!(err.code, CODE_TRANSCRIPT_NOT_READY);
        assert!(err.data.is_none());
    }
}
