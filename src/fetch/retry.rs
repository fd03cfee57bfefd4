//! Retry logic with exponential backoff for transient fetch failures.
//!
//! When a listing fetch or file download fails, the error is classified
//! into a [`FailureType`]:
//! - [`FailureType::Transient`] - temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - failures that won't succeed regardless of retries
//! - [`FailureType::RateLimited`] - server rate limiting (retries with backoff,
//!   Retry-After honored by the caller)
//!
//! The [`RetryPolicy`] then decides whether to retry based on failure type
//! and attempt count, calculating exponential backoff delays with jitter.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::FetchError;

/// Default maximum retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of fetch failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection refused.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 403 Forbidden, invalid URL, local IO errors.
    Permanent,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// Delay formula: `min(base_delay * multiplier^attempt, max_delay) + jitter`.
/// With defaults, delays are approximately 1s, 2s, 4s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry a failed fetch.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt with exponential backoff and jitter.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt is 0-indexed for the exponent (attempt 1 = 2^0 = 1x base)
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + calculate_jitter()
    }
}

/// Generates random jitter between 0 and `MAX_JITTER`.
///
/// Jitter prevents thundering herd when multiple fetches fail
/// simultaneously and retry at the same time.
#[allow(clippy::cast_possible_truncation)]
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

/// Classifies a fetch error into a failure type for retry decisions.
///
/// HTTP status codes: 408/5xx are transient, 429 is rate-limited, other
/// 4xx are permanent. Timeouts and most network errors are transient.
/// Local IO errors and invalid URLs are permanent.
#[instrument]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),
        FetchError::Timeout { .. } => FailureType::Transient,
        FetchError::Network { .. } => FailureType::Transient,
        FetchError::Io { .. } | FetchError::InvalidUrl { .. } | FetchError::Build(_) => {
            FailureType::Permanent
        }
    }
}

/// Classifies an HTTP status code into a failure type.
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_max_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_with_max_attempts_clamps_to_one() {
        let policy = RetryPolicy::with_max_attempts(0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Permanent, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_transient_failure_retried_with_delay() {
        let policy = RetryPolicy::default();
        match policy.should_retry(FailureType::Transient, 1) {
            RetryDecision::Retry { delay, attempt } => {
                assert_eq!(attempt, 2);
                // base 1s plus at most 500ms jitter
                assert!(delay >= Duration::from_secs(1));
                assert!(delay <= Duration::from_millis(1500));
            }
            RetryDecision::DoNotRetry { reason } => panic!("expected retry, got: {reason}"),
        }
    }

    #[test]
    fn test_rate_limited_failure_retried() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::RateLimited, 1);
        assert!(matches!(decision, RetryDecision::Retry { .. }));
    }

    #[test]
    fn test_max_attempts_exhausted() {
        let policy = RetryPolicy::with_max_attempts(3);
        let decision = policy.should_retry(FailureType::Transient, 3);
        match decision {
            RetryDecision::DoNotRetry { reason } => {
                assert!(reason.contains("exhausted"), "reason: {reason}");
            }
            RetryDecision::Retry { .. } => panic!("expected DoNotRetry"),
        }
    }

    #[test]
    fn test_backoff_delay_grows() {
        let policy = RetryPolicy::with_max_attempts(5);
        let d1 = match policy.should_retry(FailureType::Transient, 1) {
            RetryDecision::Retry { delay, .. } => delay,
            RetryDecision::DoNotRetry { .. } => panic!("expected retry"),
        };
        let d3 = match policy.should_retry(FailureType::Transient, 3) {
            RetryDecision::Retry { delay, .. } => delay,
            RetryDecision::DoNotRetry { .. } => panic!("expected retry"),
        };
        // attempt 3 delay (4s base) always exceeds attempt 1 delay (1s base + <=0.5s jitter)
        assert!(d3 > d1);
    }

    #[test]
    fn test_classify_http_statuses() {
        assert_eq!(
            classify_error(&FetchError::http_status("http://x/", 404)),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&FetchError::http_status("http://x/", 403)),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&FetchError::http_status("http://x/", 429)),
            FailureType::RateLimited
        );
        assert_eq!(
            classify_error(&FetchError::http_status("http://x/", 500)),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&FetchError::http_status("http://x/", 503)),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&FetchError::http_status("http://x/", 408)),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_timeout_transient() {
        assert_eq!(
            classify_error(&FetchError::timeout("http://x/")),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_io_permanent() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(
            classify_error(&FetchError::io("/tmp/x", io)),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_classify_invalid_url_permanent() {
        assert_eq!(
            classify_error(&FetchError::invalid_url("nope")),
            FailureType::Permanent
        );
    }
}
