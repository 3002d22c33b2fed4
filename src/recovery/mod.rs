//! Provider-failure classification, retry policy, and recovery execution.
//!
//! Failures map onto a fixed five-kind taxonomy; each kind carries a fixed
//! policy (retry budget, backoff base, estimation fallback). Only rate
//! limits and network failures retry. Every handled failure lands in the
//! shared [`ErrorMetrics`] regardless of whether a retry later succeeds.

mod backoff;
mod metrics;

pub use backoff::ExponentialBackoff;
pub use metrics::{ErrorMetricRow, ErrorMetrics, METRIC_RETENTION_DAYS};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{EstimateMethod, Provider};

/// Fixed failure taxonomy for provider and tokenization errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Model,
    Quota,
    Network,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth_error",
            ErrorKind::Model => "model_error",
            ErrorKind::Quota => "quota_error",
            ErrorKind::Network => "network_error",
        }
    }

    /// The fixed recovery policy for this kind.
    pub fn policy(&self) -> RetryPolicy {
        match self {
            ErrorKind::RateLimit => RetryPolicy {
                should_retry: true,
                max_retries: 3,
                base_delay: Duration::from_millis(1000),
                fallback: EstimateMethod::EnhancedEstimation,
            },
            ErrorKind::Network => RetryPolicy {
                should_retry: true,
                max_retries: 2,
                base_delay: Duration::from_millis(500),
                fallback: EstimateMethod::EnhancedEstimation,
            },
            ErrorKind::Auth => RetryPolicy {
                should_retry: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                fallback: EstimateMethod::SimpleEstimation,
            },
            ErrorKind::Model => RetryPolicy {
                should_retry: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                fallback: EstimateMethod::ProviderDefault,
            },
            ErrorKind::Quota => RetryPolicy {
                should_retry: false,
                max_retries: 0,
                base_delay: Duration::ZERO,
                fallback: EstimateMethod::SimpleEstimation,
            },
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery policy for one [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub should_retry: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Estimation method applied once retries are exhausted (or skipped).
    pub fallback: EstimateMethod,
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay, Duration::from_secs(30), 2.0)
    }
}

/// A raw provider failure at the classification boundary: the HTTP status
/// (when one exists) and the error message.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

/// Classify a provider failure. Rules apply in order; anything
/// unrecognized is treated as a network error (retryable, bounded).
pub fn classify(failure: &ProviderFailure) -> ErrorKind {
    let message = failure.message.to_lowercase();
    let has = |needle: &str| message.contains(needle);

    match failure.status {
        Some(429) => return ErrorKind::RateLimit,
        Some(401) | Some(403) => return ErrorKind::Auth,
        Some(400) => return ErrorKind::Model,
        Some(402) => return ErrorKind::Quota,
        _ => {}
    }

    if has("rate limit") || has("too many requests") {
        ErrorKind::RateLimit
    } else if has("unauthorized") || has("api key") {
        ErrorKind::Auth
    } else if has("model") || has("not found") {
        ErrorKind::Model
    } else if has("quota") || has("billing") || has("insufficient") {
        ErrorKind::Quota
    } else if has("network")
        || has("timeout")
        || has("timed out")
        || has("dns")
        || has("connection reset")
        || has("econnreset")
        || has("econnrefused")
    {
        ErrorKind::Network
    } else {
        ErrorKind::Network
    }
}

/// Issued when recovery gives up on getting exact data: the caller should
/// estimate with `method` instead of failing.
#[derive(Debug, Clone)]
pub struct FallbackDirective {
    pub kind: ErrorKind,
    pub method: EstimateMethod,
    pub last_failure: ProviderFailure,
}

/// Retry executor over the fixed policy table.
#[derive(Clone, Default)]
pub struct Recovery {
    metrics: Arc<ErrorMetrics>,
}

impl Recovery {
    pub fn new(metrics: Arc<ErrorMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Arc<ErrorMetrics> {
        &self.metrics
    }

    /// Run `operation` under the policy of whatever failure it produces.
    /// Retryable kinds back off exponentially; non-retryable kinds and
    /// exhausted retries yield a [`FallbackDirective`] instead of an error,
    /// because every call site has an estimation path.
    pub async fn execute<T, F, Fut>(
        &self,
        provider: Provider,
        model: &str,
        mut operation: F,
    ) -> Result<T, FallbackDirective>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderFailure>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let failure = match operation().await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            let kind = classify(&failure);
            self.metrics.record(provider, model, kind);
            let policy = kind.policy();

            if policy.should_retry && attempt < policy.max_retries {
                let delay = policy.backoff().delay_for(attempt);
                debug!(
                    provider = %provider,
                    model,
                    kind = kind.as_str(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after provider failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            warn!(
                provider = %provider,
                model,
                kind = kind.as_str(),
                attempts = attempt + 1,
                fallback = policy.fallback.as_str(),
                "provider failure not recoverable, falling back to estimation"
            );
            return Err(FallbackDirective {
                kind,
                method: policy.fallback,
                last_failure: failure,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_classify_by_status() {
        assert_eq!(
            classify(&ProviderFailure::new(429, "slow down")),
            ErrorKind::RateLimit
        );
        assert_eq!(classify(&ProviderFailure::new(401, "")), ErrorKind::Auth);
        assert_eq!(classify(&ProviderFailure::new(403, "")), ErrorKind::Auth);
        assert_eq!(classify(&ProviderFailure::new(400, "")), ErrorKind::Model);
        assert_eq!(classify(&ProviderFailure::new(402, "")), ErrorKind::Quota);
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(
            classify(&ProviderFailure::message("Too Many Requests")),
            ErrorKind::RateLimit
        );
        assert_eq!(
            classify(&ProviderFailure::message("invalid API key provided")),
            ErrorKind::Auth
        );
        assert_eq!(
            classify(&ProviderFailure::message("model gpt-5o not found")),
            ErrorKind::Model
        );
        assert_eq!(
            classify(&ProviderFailure::message("billing hard limit reached")),
            ErrorKind::Quota
        );
        assert_eq!(
            classify(&ProviderFailure::message("connection reset by peer")),
            ErrorKind::Network
        );
    }

    #[test]
    fn test_classify_default_is_network() {
        assert_eq!(
            classify(&ProviderFailure::message("something inexplicable")),
            ErrorKind::Network
        );
    }

    #[test]
    fn test_rate_limit_keyword_beats_model_keyword() {
        // Ordered rules: "rate limit" wins even when "model" also appears.
        assert_eq!(
            classify(&ProviderFailure::message("model hit a rate limit")),
            ErrorKind::RateLimit
        );
    }

    #[test]
    fn test_policy_table() {
        assert_eq!(ErrorKind::RateLimit.policy().max_retries, 3);
        assert_eq!(ErrorKind::Network.policy().max_retries, 2);
        for kind in [ErrorKind::Auth, ErrorKind::Model, ErrorKind::Quota] {
            assert!(!kind.policy().should_retry, "{kind} must not retry");
        }
        assert_eq!(
            ErrorKind::Model.policy().fallback,
            EstimateMethod::ProviderDefault
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let recovery = Recovery::default();
        let calls = AtomicU32::new(0);

        let result = recovery
            .execute(Provider::OpenAi, "gpt-4o", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderFailure::new(429, "rate limit"))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Both failed attempts were recorded even though the call succeeded.
        let rows = recovery.metrics().snapshot();
        assert_eq!(rows[0].count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_yields_fallback() {
        let recovery = Recovery::default();

        let result: Result<(), _> = recovery
            .execute(Provider::Google, "gemini-1.5-pro", || async {
                Err(ProviderFailure::message("request timed out"))
            })
            .await;

        let directive = result.unwrap_err();
        assert_eq!(directive.kind, ErrorKind::Network);
        assert_eq!(directive.method, EstimateMethod::EnhancedEstimation);
        // 1 initial + 2 retries
        assert_eq!(recovery.metrics().snapshot()[0].count, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let recovery = Recovery::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = recovery
            .execute(Provider::Anthropic, "claude-3-opus", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderFailure::new(401, "unauthorized")) }
            })
            .await;

        assert_eq!(result.unwrap_err().method, EstimateMethod::SimpleEstimation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
