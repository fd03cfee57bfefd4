//! Crawl orchestration: wires configuration, discovery, the worker pool,
//! and the progress store into one run.
//!
//! A run is one discovery task feeding N download workers through a
//! bounded channel, with a periodic persist task flushing the progress
//! file. Discovery dropping the channel sender is the completion signal;
//! the run then joins the workers, persists a final time, and returns the
//! derived statistics. Interruption takes the same path, so a cancelled
//! run still ends with a consistent progress file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use url::Url;

use crate::config::{ConfigError, CrawlConfig};
use crate::discover::Discovery;
use crate::fetch::retry::{RetryDecision, RetryPolicy, classify_error};
use crate::fetch::{DestMapper, FetchError, HttpClient, RateLimiter, WorkerPool};
use crate::listing::looks_like_listing_shell;
use crate::progress::{ProgressError, ProgressStore, Statistics};
use crate::report;
use crate::shutdown::ShutdownToken;

/// Intake channel capacity; bounds how far discovery runs ahead of the
/// workers.
const INTAKE_CAPACITY: usize = 64;

/// How often the progress file is flushed during a run.
const PERSIST_INTERVAL: Duration = Duration::from_secs(10);

/// Fatal errors that stop a run before or at startup.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] FetchError),

    #[error("root URL unreachable: {0}")]
    RootUnreachable(#[source] FetchError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error("cannot prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Runs one crawl to completion (or until the token triggers).
///
/// Partial failure is not an error: entry-level problems end up as
/// records in the returned statistics. An `Err` means the run could not
/// start at all.
///
/// # Errors
///
/// Returns [`CrawlError`] for invalid configuration, an unwritable output
/// directory, a client that cannot be built, an unreachable root URL, or
/// a progress file that cannot be read or written.
#[instrument(skip_all, fields(url = %config.url))]
pub async fn run(config: CrawlConfig, token: ShutdownToken) -> Result<Statistics, CrawlError> {
    config.validate()?;

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .map_err(|e| CrawlError::OutputDir {
            path: config.output_dir.clone(),
            source: e,
        })?;

    let client = HttpClient::new(&config.user_agent, config.timeout, config.verify_ssl)?;
    let policy = RetryPolicy::default();
    let progress_path = config.progress_path();

    let store = Arc::new(load_store(&config).await?);

    if probe_root(&client, &policy, &config.url, &token).await? {
        // Cancelled before the crawl started; nothing to report.
        return Ok(store.statistics());
    }

    let limiter = Arc::new(RateLimiter::new(config.delay));
    let mapper = DestMapper::new(&config.url, &config.output_dir);
    let bar = report::download_bar();

    let (tx, rx) = mpsc::channel(INTAKE_CAPACITY);
    let pool = WorkerPool::new(
        client.clone(),
        Arc::clone(&limiter),
        Arc::clone(&store),
        token.clone(),
        policy.clone(),
    )
    .dry_run(config.dry_run)
    .extension_filter(&config.extensions)
    .progress_bar(bar.clone());
    let workers = pool.spawn(config.workers, rx);

    let persist_task = spawn_persist_task(Arc::clone(&store), progress_path.clone());

    let discovery = Discovery::new(
        client,
        limiter,
        Arc::clone(&store),
        token.clone(),
        policy,
        mapper,
    )
    .max_depth(config.max_depth)
    .ignore_robots(config.ignore_robots);

    // run() consumes tx; the channel closes when discovery returns, which
    // lets the workers drain and exit.
    discovery.run(config.url.clone(), tx).await;

    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "download worker panicked");
        }
    }

    persist_task.abort();
    store.persist(&progress_path).await?;
    bar.finish_and_clear();

    info!(path = %progress_path.display(), "progress saved");
    Ok(store.statistics())
}

/// Loads or creates the progress store per the resume setting. An
/// explicitly named resume file that cannot be read is fatal.
async fn load_store(config: &CrawlConfig) -> Result<ProgressStore, CrawlError> {
    let Some(path) = &config.resume_from else {
        return Ok(ProgressStore::new(&config.url));
    };
    let state = ProgressStore::load(path).await?;
    if state.base_url != config.url.as_str() {
        warn!(
            previous = %state.base_url,
            current = %config.url,
            "progress file is for a different root URL, starting fresh"
        );
        return Ok(ProgressStore::new(&config.url));
    }
    info!(
        downloaded = state.downloaded.len(),
        failed = state.failed.len(),
        "resuming from previous run"
    );
    Ok(ProgressStore::from_state(state))
}

/// Verifies the root URL responds before any workers spawn. Returns
/// `Ok(true)` when shutdown triggered mid-probe.
async fn probe_root(
    client: &HttpClient,
    policy: &RetryPolicy,
    root: &Url,
    token: &ShutdownToken,
) -> Result<bool, CrawlError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match client.fetch_listing(root).await {
            Ok(response) => {
                if !looks_like_listing_shell(&response.body) {
                    warn!(
                        url = %root,
                        "root page does not look like a directory listing"
                    );
                }
                return Ok(false);
            }
            Err(error) => match policy.should_retry(classify_error(&error), attempt) {
                RetryDecision::Retry { delay, .. } => {
                    warn!(url = %root, attempt, %error, "root probe failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = token.cancelled() => return Ok(true),
                    }
                }
                RetryDecision::DoNotRetry { .. } => {
                    return Err(CrawlError::RootUnreachable(error));
                }
            },
        }
    }
}

fn spawn_persist_task(store: Arc<ProgressStore>, path: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if let Err(e) = store.persist(&path).await {
                warn!(error = %e, "periodic progress persist failed");
            }
        }
    })
}
