//! Run configuration and validation.
//!
//! All knobs a crawl accepts live here, validated once before any network
//! activity. The CLI layer builds a [`CrawlConfig`] from parsed arguments;
//! library callers construct one directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Name of the progress file inside the output directory.
pub const PROGRESS_FILE_NAME: &str = "crawl_progress.json";

/// Browser-like default User-Agent; some listing servers refuse obvious
/// bot agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Configuration errors, all fatal before the first request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme '{scheme}' (use http or https)")]
    UnsupportedScheme { scheme: String },

    #[error("URL has no host: '{url}'")]
    MissingHost { url: String },

    #[error("worker count must be at least 1")]
    InvalidWorkers,

    #[error("timeout must be greater than zero")]
    InvalidTimeout,
}

/// Validated configuration for one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub url: Url,
    pub output_dir: PathBuf,
    pub max_depth: u32,
    pub workers: usize,
    /// Minimum delay between requests to the same authority.
    pub delay: Duration,
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub user_agent: String,
    /// Only download files with these extensions; empty means all.
    pub extensions: Vec<String>,
    pub ignore_robots: bool,
    pub dry_run: bool,
    /// Progress file from a previous run to resume from.
    pub resume_from: Option<PathBuf>,
}

impl CrawlConfig {
    /// Builds a configuration with default knobs for the given root URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the URL does not parse or is not an
    /// http(s) URL with a host.
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let parsed = parse_root_url(url)?;
        Ok(Self {
            url: parsed,
            output_dir: PathBuf::from("downloads"),
            max_depth: 10,
            workers: 5,
            delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            verify_ssl: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            extensions: Vec::new(),
            ignore_robots: false,
            dry_run: false,
            resume_from: None,
        })
    }

    /// Re-checks the invariants a hand-built configuration must hold.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_root_url(&self.url)?;
        if self.workers == 0 {
            return Err(ConfigError::InvalidWorkers);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }

    /// Where this run's progress file lives.
    #[must_use]
    pub fn progress_path(&self) -> PathBuf {
        self.output_dir.join(PROGRESS_FILE_NAME)
    }

    #[must_use]
    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = dir.as_ref().to_path_buf();
        self
    }
}

fn parse_root_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    check_root_url(&parsed)?;
    Ok(parsed)
}

fn check_root_url(url: &Url) -> Result<(), ConfigError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::MissingHost {
            url: url.to_string(),
        });
    }
    Ok(())
}
