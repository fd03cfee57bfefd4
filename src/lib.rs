//! Core library for `dirgrab`, a recursive downloader for HTTP directory
//! listings.
//!
//! The pipeline: [`discover`] walks the remote tree breadth-first,
//! [`listing`] turns heterogeneous autoindex pages into normalized
//! entries, [`fetch`] downloads files through a fixed worker pool, and
//! [`progress`] keeps the durable record that makes resumption and the
//! final statistics possible. [`crawler::run`] wires it all together.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod crawler;
pub mod discover;
pub mod fetch;
pub mod listing;
pub mod progress;
pub mod report;
pub mod shutdown;

pub use config::{ConfigError, CrawlConfig};
pub use crawler::CrawlError;
pub use progress::{DownloadRecord, ProgressState, ProgressStore, Statistics};
pub use shutdown::ShutdownToken;
