//! Per-authority rate limiting for crawl and download requests.
//!
//! Enforces a minimum delay between requests to the same authority
//! (host:port). Requests to different authorities proceed in parallel;
//! only subsequent requests to the *same* authority are delayed. The
//! delay counter is shared between the discovery side and the download
//! workers, so the inter-request delay holds across both.
//!
//! Designed to be wrapped in `Arc` and shared across Tokio tasks: a
//! `DashMap` holds per-authority state, and a `tokio::sync::Mutex` per
//! authority serializes the read-update of the last-request instant.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

/// Warning threshold for cumulative delay per authority (60 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(60);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-authority rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum delay between requests to the same authority.
    delay: Duration,

    /// Whether rate limiting is disabled (`--delay 0`).
    disabled: bool,

    /// Per-authority state. Arc lets us clone the state out and release
    /// the `DashMap` shard lock before awaiting on the inner Mutex.
    authorities: DashMap<String, Arc<AuthorityState>>,
}

#[derive(Debug)]
struct AuthorityState {
    /// Time of the last request to this authority. `None` means no request
    /// yet (the first request is immediate).
    last_request: Mutex<Option<Instant>>,

    /// Cumulative delay applied, for the excessive-throttling warning.
    cumulative_delay_ms: AtomicU64,
}

impl AuthorityState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a new rate limiter with the specified inter-request delay.
    /// A zero delay disables rate limiting.
    #[must_use]
    #[instrument(skip_all, fields(delay_ms = delay.as_millis()))]
    pub fn new(delay: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            delay,
            disabled: delay.is_zero(),
            authorities: DashMap::new(),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the configured inter-request delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Acquires permission to make a request to the URL's authority,
    /// sleeping as needed to respect the minimum delay. The first request
    /// to any authority proceeds immediately.
    #[instrument(skip(self), fields(authority))]
    pub async fn acquire(&self, url: &Url) {
        if self.disabled {
            return;
        }

        let authority = authority_key(url);
        tracing::Span::current().record("authority", authority.as_str());

        // Clone the Arc to release the DashMap lock before awaiting.
        let state = self
            .authorities
            .entry(authority.clone())
            .or_insert_with(|| Arc::new(AuthorityState::new()))
            .clone();

        let mut last_request = state.last_request.lock().await;

        if let Some(last) = *last_request {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                let wait = self.delay.saturating_sub(elapsed);
                let cumulative = state.add_cumulative_delay(wait);

                debug!(
                    authority = %authority,
                    delay_ms = wait.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "applying rate limit delay"
                );

                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        authority = %authority,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "excessive rate limiting - consider a smaller tree or fewer workers"
                    );
                }

                tokio::time::sleep(wait).await;
            }
        } else {
            debug!(authority = %authority, "first request to authority - no delay");
        }

        *last_request = Some(Instant::now());
    }

    /// Records a server-mandated delay (from a Retry-After header) so the
    /// cumulative-throttling warning reflects it.
    #[instrument(skip(self), fields(authority))]
    pub fn record_rate_limit(&self, url: &Url, delay: Duration) {
        let authority = authority_key(url);
        tracing::Span::current().record("authority", authority.as_str());

        let state = self
            .authorities
            .entry(authority.clone())
            .or_insert_with(|| Arc::new(AuthorityState::new()));
        let cumulative = state.add_cumulative_delay(delay);

        debug!(
            authority = %authority,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
    }
}

/// Builds the cache key for a URL's authority (lowercased host, explicit
/// port when present).
#[must_use]
pub fn authority_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown").to_lowercase();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 formats: integer seconds and HTTP-date.
/// Returns `None` if the value cannot be parsed; caps excessive values
/// at one hour.
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    // HTTP-date format: delay is the time until that date.
    if let Ok(date) = httpdate::parse_http_date(header_value) {
        let delay = date
            .duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO);
        return Some(delay.min(MAX_RETRY_AFTER));
    }

    debug!(value = header_value, "unparsable Retry-After value");
    None
}
