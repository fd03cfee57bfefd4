//! Fixed-size download worker pool.
//!
//! N workers consume file tasks from one shared intake receiver. Each task
//! runs the same gate sequence: extension filter, resume short-circuit,
//! dry-run, then the actual transfer with bounded retries. Every task ends
//! in exactly one terminal record on the progress store.
//!
//! Cancellation drains: a worker that observes the shutdown token stops
//! taking new tasks, but a transfer already in flight runs to completion
//! so its record is never lost.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use indicatif::ProgressBar;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::progress::{DownloadRecord, ProgressStore};
use crate::shutdown::ShutdownToken;

use super::rate_limiter::parse_retry_after;
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use super::{FetchError, HttpClient, RateLimiter};

/// One file to download, produced by discovery.
///
/// The destination path is assigned on the discovery side so that path
/// assignment does not depend on worker scheduling.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub url: Url,
    pub dest: PathBuf,
    /// Listed size, informational only.
    pub size: Option<u64>,
}

/// The download stage: configuration shared by all workers.
pub struct WorkerPool {
    client: HttpClient,
    limiter: Arc<RateLimiter>,
    store: Arc<ProgressStore>,
    token: ShutdownToken,
    policy: RetryPolicy,
    dry_run: bool,
    /// Lowercased extensions without the leading dot; `None` accepts all.
    extensions: Option<HashSet<String>>,
    bar: ProgressBar,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        client: HttpClient,
        limiter: Arc<RateLimiter>,
        store: Arc<ProgressStore>,
        token: ShutdownToken,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            limiter,
            store,
            token,
            policy,
            dry_run: false,
            extensions: None,
            bar: ProgressBar::hidden(),
        }
    }

    /// Enables dry-run mode: tasks are recorded as skipped instead of
    /// transferred.
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Restricts downloads to the given extensions (leading dots and case
    /// are ignored). An empty list means no restriction.
    #[must_use]
    pub fn extension_filter(mut self, extensions: &[String]) -> Self {
        let normalized: HashSet<String> = extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self.extensions = if normalized.is_empty() {
            None
        } else {
            Some(normalized)
        };
        self
    }

    /// Attaches a progress bar ticked once per terminal record.
    #[must_use]
    pub fn progress_bar(mut self, bar: ProgressBar) -> Self {
        self.bar = bar;
        self
    }

    /// Spawns `workers` tasks sharing the intake receiver. The returned
    /// handles complete when the channel closes or shutdown triggers.
    #[must_use]
    pub fn spawn(self, workers: usize, rx: mpsc::Receiver<FileTask>) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        let rx = Arc::new(Mutex::new(rx));

        (0..workers)
            .map(|id| {
                let pool = Arc::clone(&pool);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    pool.worker_loop(id, rx).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, id: usize, rx: Arc<Mutex<mpsc::Receiver<FileTask>>>) {
        debug!(worker = id, "download worker started");
        loop {
            if self.token.is_triggered() {
                break;
            }
            // The lock is only held while waiting for the next task, so
            // one slow download never starves the other workers.
            let next = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    task = guard.recv() => task,
                    () = self.token.cancelled() => None,
                }
            };
            let Some(task) = next else {
                break;
            };
            self.process(task).await;
        }
        debug!(worker = id, "download worker finished");
    }

    #[instrument(skip(self, task), fields(url = %task.url))]
    async fn process(&self, task: FileTask) {
        if !self.passes_extension_filter(&task.url) {
            debug!("skipping: extension filter");
            self.finish(DownloadRecord::skipped(&task.url, "extension filter"));
            return;
        }

        if self.store.is_downloaded(&task.url) {
            debug!("skipping: already downloaded in a previous run");
            self.finish(DownloadRecord::skipped(&task.url, "already downloaded"));
            return;
        }

        if self.dry_run {
            info!(dest = %task.dest.display(), size = ?task.size, "dry run: would download");
            self.finish(DownloadRecord::skipped(&task.url, "dry run"));
            return;
        }

        let record = self.download_with_retries(&task).await;
        if let Some(record) = record {
            self.finish(record);
        }
    }

    /// Runs the transfer with bounded retries. Returns `None` only when
    /// shutdown interrupts before the transfer reached a terminal state;
    /// the URL then stays eligible for a later resumed run.
    async fn download_with_retries(&self, task: &FileTask) -> Option<DownloadRecord> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            tokio::select! {
                () = self.limiter.acquire(&task.url) => {}
                () = self.token.cancelled() => {
                    debug!("shutdown before transfer started");
                    return None;
                }
            }

            match self.client.download(&task.url, &task.dest).await {
                Ok(bytes) => {
                    let duration_ms = u64::try_from(started.elapsed().as_millis())
                        .unwrap_or(u64::MAX);
                    return Some(DownloadRecord::succeeded(
                        &task.url,
                        &task.dest,
                        bytes,
                        duration_ms,
                    ));
                }
                Err(error) => {
                    self.note_rate_limit(&task.url, &error);
                    let failure = classify_error(&error);
                    match self.policy.should_retry(failure, attempt) {
                        RetryDecision::Retry { delay, .. } => {
                            warn!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                %error,
                                "download failed, retrying"
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = self.token.cancelled() => {
                                    debug!("shutdown during retry backoff");
                                    return None;
                                }
                            }
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            warn!(attempt, %error, reason, "download failed permanently");
                            return Some(DownloadRecord::failed(&task.url, error.to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Feeds a server-provided Retry-After into the per-authority limiter.
    fn note_rate_limit(&self, url: &Url, error: &FetchError) {
        if let FetchError::HttpStatus {
            retry_after: Some(value),
            ..
        } = error
            && let Some(delay) = parse_retry_after(value)
        {
            self.limiter.record_rate_limit(url, delay);
        }
    }

    fn passes_extension_filter(&self, url: &Url) -> bool {
        match &self.extensions {
            None => true,
            Some(allowed) => extension_of(url).is_some_and(|ext| allowed.contains(&ext)),
        }
    }

    fn finish(&self, record: DownloadRecord) {
        self.bar.inc(1);
        if let Some(name) = record.url.rsplit('/').next() {
            self.bar.set_message(name.to_string());
        }
        self.store.record(record);
    }
}

/// Lowercased extension of the URL's last path segment.
fn extension_of(url: &Url) -> Option<String> {
    let segment = url.path().rsplit('/').next()?;
    let idx = segment.rfind('.')?;
    if idx == 0 || idx == segment.len() - 1 {
        return None;
    }
    Some(segment[idx + 1..].to_lowercase())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn client() -> HttpClient {
        HttpClient::new("test-agent/1.0", Duration::from_secs(10), true).unwrap()
    }

    fn pool_for(store: Arc<ProgressStore>) -> WorkerPool {
        WorkerPool::new(
            client(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            store,
            ShutdownToken::new(),
            RetryPolicy::with_max_attempts(1),
        )
    }

    async fn run_pool(pool: WorkerPool, workers: usize, tasks: Vec<FileTask>) {
        let (tx, rx) = mpsc::channel(16);
        let handles = pool.spawn(workers, rx);
        for task in tasks {
            tx.send(task).await.unwrap();
        }
        drop(tx);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(
            extension_of(&url("http://e.com/files/a.TXT")),
            Some("txt".to_string())
        );
        assert_eq!(extension_of(&url("http://e.com/files/noext")), None);
        assert_eq!(extension_of(&url("http://e.com/files/.hidden")), None);
    }

    #[test]
    fn test_extension_filter_normalization() {
        let store = Arc::new(ProgressStore::new(&url("http://e.com/")));
        let pool = pool_for(store)
            .extension_filter(&[".PDF".to_string(), " txt".to_string(), String::new()]);
        assert!(pool.passes_extension_filter(&url("http://e.com/a.pdf")));
        assert!(pool.passes_extension_filter(&url("http://e.com/a.txt")));
        assert!(!pool.passes_extension_filter(&url("http://e.com/a.iso")));
    }

    #[test]
    fn test_empty_extension_filter_accepts_all() {
        let store = Arc::new(ProgressStore::new(&url("http://e.com/")));
        let pool = pool_for(store).extension_filter(&[]);
        assert!(pool.passes_extension_filter(&url("http://e.com/anything.xyz")));
    }

    #[tokio::test]
    async fn test_pool_downloads_and_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/a.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let base = url(&format!("{}/files/", server.uri()));
        let store = Arc::new(ProgressStore::new(&base));
        let task = FileTask {
            url: url(&format!("{}/files/a.txt", server.uri())),
            dest: dir.path().join("a.txt"),
            size: Some(5),
        };

        run_pool(pool_for(Arc::clone(&store)), 2, vec![task]).await;

        let snap = store.snapshot();
        assert_eq!(snap.downloaded.len(), 1);
        assert_eq!(snap.downloaded[0].bytes, 5);
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_resume_short_circuit_skips_transfer() {
        let server = MockServer::start().await;
        // Zero expected requests: the succeeded record must short-circuit.
        Mock::given(method("GET"))
            .and(path("/files/a.txt"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let base = url(&format!("{}/files/", server.uri()));
        let target = url(&format!("{}/files/a.txt", server.uri()));
        let store = Arc::new(ProgressStore::new(&base));
        store.record(DownloadRecord::succeeded(
            &target,
            &dir.path().join("a.txt"),
            5,
            1,
        ));

        let task = FileTask {
            url: target,
            dest: dir.path().join("a.txt"),
            size: None,
        };
        run_pool(pool_for(Arc::clone(&store)), 1, vec![task]).await;

        let snap = store.snapshot();
        assert_eq!(snap.skipped.len(), 1);
        assert_eq!(snap.skipped[0].error.as_deref(), Some("already downloaded"));
    }

    #[tokio::test]
    async fn test_dry_run_records_skip_without_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let base = url(&format!("{}/files/", server.uri()));
        let store = Arc::new(ProgressStore::new(&base));
        let task = FileTask {
            url: url(&format!("{}/files/a.txt", server.uri())),
            dest: dir.path().join("a.txt"),
            size: None,
        };

        run_pool(pool_for(Arc::clone(&store)).dry_run(true), 1, vec![task]).await;

        let snap = store.snapshot();
        assert_eq!(snap.skipped.len(), 1);
        assert_eq!(snap.skipped[0].error.as_deref(), Some("dry run"));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_permanent_failure_recorded_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/gone.txt"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let base = url(&format!("{}/files/", server.uri()));
        let store = Arc::new(ProgressStore::new(&base));
        let task = FileTask {
            url: url(&format!("{}/files/gone.txt", server.uri())),
            dest: dir.path().join("gone.txt"),
            size: None,
        };

        run_pool(pool_for(Arc::clone(&store)), 1, vec![task]).await;

        let snap = store.snapshot();
        assert_eq!(snap.failed.len(), 1);
        assert!(snap.failed[0].error.as_deref().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_triggered_shutdown_stops_intake() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let base = url(&format!("{}/files/", server.uri()));
        let store = Arc::new(ProgressStore::new(&base));
        let token = ShutdownToken::new();
        token.trigger();

        let pool = WorkerPool::new(
            client(),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            Arc::clone(&store),
            token,
            RetryPolicy::with_max_attempts(1),
        );

        let (tx, rx) = mpsc::channel(4);
        let handles = pool.spawn(1, rx);
        tx.send(FileTask {
            url: url(&format!("{}/files/a.txt", server.uri())),
            dest: dir.path().join("a.txt"),
            size: None,
        })
        .await
        .unwrap();
        drop(tx);
        for handle in handles {
            handle.await.unwrap();
        }

        // Nothing reached a terminal state; a resumed run re-attempts it.
        assert!(store.snapshot().downloaded.is_empty());
    }
}
