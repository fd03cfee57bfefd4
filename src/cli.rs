//! Command-line interface definitions.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::config::{ConfigError, CrawlConfig};

/// Recursive downloader for HTTP directory listings.
#[derive(Parser, Debug)]
#[command(name = "dirgrab", version, about)]
pub struct Args {
    /// Root directory-listing URL to crawl
    pub url: String,

    /// Output directory for downloaded files
    #[arg(short, long, default_value = "downloads")]
    pub output: PathBuf,

    /// Maximum directory depth below the root
    #[arg(short = 'd', long, default_value_t = 10)]
    pub max_depth: u32,

    /// Number of concurrent download workers
    #[arg(
        short,
        long,
        default_value_t = 5,
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    pub workers: u8,

    /// Delay between requests to the same host, in seconds
    #[arg(long, default_value_t = 1.0)]
    pub delay: f64,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,

    /// Disable TLS certificate verification
    #[arg(long)]
    pub no_verify_ssl: bool,

    /// Custom User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Only download files with these extensions (comma-separated)
    #[arg(long, value_delimiter = ',', value_name = "EXT,...")]
    pub extensions: Vec<String>,

    /// Do not fetch or honor robots.txt
    #[arg(long)]
    pub ignore_robots: bool,

    /// Discover and report without downloading anything
    #[arg(long)]
    pub dry_run: bool,

    /// Resume from a previous run's progress file
    #[arg(long, value_name = "FILE")]
    pub resume: Option<PathBuf>,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Converts parsed arguments into a validated crawl configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the URL is malformed or not http(s).
    pub fn into_config(self) -> Result<CrawlConfig, ConfigError> {
        let mut config = CrawlConfig::new(&self.url)?;
        config.output_dir = self.output;
        config.max_depth = self.max_depth;
        config.workers = usize::from(self.workers);
        config.delay = delay_duration(self.delay);
        config.timeout = Duration::from_secs(self.timeout);
        config.verify_ssl = !self.no_verify_ssl;
        if let Some(agent) = self.user_agent {
            config.user_agent = agent;
        }
        config.extensions = self.extensions;
        config.ignore_robots = self.ignore_robots;
        config.dry_run = self.dry_run;
        config.resume_from = self.resume;
        Ok(config)
    }

    /// Default tracing filter derived from the verbosity flags.
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}

/// Seconds-as-float to a Duration; negative and non-finite inputs mean
/// no delay.
fn delay_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}
