//! HTTP transfer layer: client, retry policy, politeness, and the
//! download worker pool.

pub mod client;
pub mod dest;
pub mod error;
pub mod pool;
pub mod rate_limiter;
pub mod retry;
pub mod robots;

pub use client::{HttpClient, ListingResponse};
pub use dest::DestMapper;
pub use error::FetchError;
pub use pool::{FileTask, WorkerPool};
pub use rate_limiter::{RateLimiter, authority_key, parse_retry_after};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
pub use robots::{RobotsDecision, RobotsPolicy};
