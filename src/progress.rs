//! Persistent crawl progress and derived statistics.
//!
//! A single [`ProgressStore`] is the only shared mutation point of a run:
//! discovery marks URLs as seen, workers append terminal download records,
//! and the periodic persist task plus the final flush write the state to
//! disk. Counters are never stored independently; [`Statistics`] is
//! derived from the records at snapshot time, so the on-disk file and the
//! printed summary can never disagree with the record log.
//!
//! Writes are atomic (temp file + rename), so an interrupted run always
//! leaves either the previous complete file or the new complete file.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

/// Errors from loading or persisting the progress file.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("progress file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

impl ProgressError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Terminal outcome of one file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// One terminal record for a discovered file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub url: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Failure or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl DownloadRecord {
    #[must_use]
    pub fn succeeded(url: &Url, local_path: &Path, bytes: u64, duration_ms: u64) -> Self {
        Self {
            url: url.to_string(),
            status: RecordStatus::Succeeded,
            local_path: Some(local_path.display().to_string()),
            error: None,
            bytes,
            duration_ms,
        }
    }

    #[must_use]
    pub fn failed(url: &Url, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            status: RecordStatus::Failed,
            local_path: None,
            error: Some(error.into()),
            bytes: 0,
            duration_ms: 0,
        }
    }

    #[must_use]
    pub fn skipped(url: &Url, reason: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            status: RecordStatus::Skipped,
            local_path: None,
            error: Some(reason.into()),
            bytes: 0,
            duration_ms: 0,
        }
    }
}

/// The full crawl state, as persisted to the progress file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressState {
    pub base_url: String,
    /// Run start, seconds since the Unix epoch.
    pub started_at: u64,
    #[serde(rename = "visited_urls", default)]
    pub discovered_urls: BTreeSet<String>,
    #[serde(rename = "downloaded_files", default)]
    pub downloaded: Vec<DownloadRecord>,
    #[serde(rename = "failed_downloads", default)]
    pub failed: Vec<DownloadRecord>,
    #[serde(rename = "skipped_files", default)]
    pub skipped: Vec<DownloadRecord>,
}

/// Statistics derived from the record log at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub duration_secs: u64,
    pub urls_discovered: usize,
    /// Files that reached a terminal state (downloaded, failed, or skipped).
    pub files_found: usize,
    pub files_downloaded: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub bytes_downloaded: u64,
    /// Bytes per second over the run duration; zero for an empty run.
    pub average_speed: f64,
    /// Succeeded over attempted (succeeded + failed), in percent.
    pub success_rate: f64,
    /// Most frequent extensions among downloaded files, descending.
    pub top_extensions: Vec<(String, usize)>,
}

/// On-disk shape: the state plus the statistics block computed at write
/// time. Statistics are informational in the file; load ignores them and
/// recomputes.
#[derive(Debug, Serialize, Deserialize)]
struct ProgressFile {
    #[serde(flatten)]
    state: ProgressState,
    statistics: Option<Statistics>,
}

struct Inner {
    state: ProgressState,
    /// URLs with a succeeded record, for the resume short-circuit.
    succeeded: HashSet<String>,
}

/// Thread-safe progress store shared by discovery, workers, and the
/// persist task.
pub struct ProgressStore {
    inner: Mutex<Inner>,
}

impl ProgressStore {
    /// Creates an empty store for a fresh run.
    #[must_use]
    pub fn new(base_url: &Url) -> Self {
        Self::from_state(ProgressState {
            base_url: base_url.to_string(),
            started_at: epoch_secs(),
            discovered_urls: BTreeSet::new(),
            downloaded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        })
    }

    /// Creates a store seeded from a loaded state (resume).
    ///
    /// Succeeded downloads short-circuit. Failed and skipped records are
    /// dropped: their URLs are re-attempted this run and will produce
    /// fresh terminal records, so carrying the stale ones would double-count
    /// them in the derived statistics.
    #[must_use]
    pub fn from_state(mut state: ProgressState) -> Self {
        state.started_at = epoch_secs();
        state.failed.clear();
        state.skipped.clear();
        let succeeded = state
            .downloaded
            .iter()
            .map(|r| r.url.clone())
            .collect::<HashSet<_>>();
        Self {
            inner: Mutex::new(Inner { state, succeeded }),
        }
    }

    /// Marks a URL as discovered. Returns `true` the first time.
    pub fn mark_discovered(&self, url: &str) -> bool {
        self.lock().state.discovered_urls.insert(url.to_string())
    }

    /// Whether a prior run already downloaded this URL successfully.
    pub fn is_downloaded(&self, url: &Url) -> bool {
        self.lock().succeeded.contains(url.as_str())
    }

    /// Appends a terminal record.
    pub fn record(&self, record: DownloadRecord) {
        let mut inner = self.lock();
        match record.status {
            RecordStatus::Succeeded => {
                inner.succeeded.insert(record.url.clone());
                inner.state.downloaded.push(record);
            }
            RecordStatus::Failed => inner.state.failed.push(record),
            RecordStatus::Skipped => inner.state.skipped.push(record),
        }
    }

    /// A point-in-time copy of the full state.
    #[must_use]
    pub fn snapshot(&self) -> ProgressState {
        self.lock().state.clone()
    }

    /// Derives statistics from the current record log.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        derive_statistics(&self.snapshot())
    }

    /// Atomically writes the state (plus a statistics block) to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError`] on serialization or file I/O failure.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn persist(&self, path: &Path) -> Result<(), ProgressError> {
        let state = self.snapshot();
        let statistics = derive_statistics(&state);
        let file = ProgressFile {
            state,
            statistics: Some(statistics),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp = temp_path_for(path);
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| ProgressError::io(tmp.clone(), e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ProgressError::io(path.to_path_buf(), e))?;

        debug!(bytes = json.len(), "persisted progress");
        Ok(())
    }

    /// Loads a previously persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError`] when the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<ProgressState, ProgressError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ProgressError::io(path.to_path_buf(), e))?;
        let file: ProgressFile = serde_json::from_slice(&bytes)?;
        Ok(file.state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens after a panic in another holder;
        // the state itself is still consistent record-by-record.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ProgressStore")
            .field("base_url", &inner.state.base_url)
            .field("discovered", &inner.state.discovered_urls.len())
            .field("downloaded", &inner.state.downloaded.len())
            .field("failed", &inner.state.failed.len())
            .field("skipped", &inner.state.skipped.len())
            .finish()
    }
}

// Precision loss in the casts below is fine: statistics are display-only.
#[allow(clippy::cast_precision_loss)]
fn derive_statistics(state: &ProgressState) -> Statistics {
    let files_downloaded = state.downloaded.len();
    let files_failed = state.failed.len();
    let files_skipped = state.skipped.len();
    let bytes_downloaded: u64 = state.downloaded.iter().map(|r| r.bytes).sum();

    let duration_secs = epoch_secs().saturating_sub(state.started_at);
    let average_speed = if duration_secs == 0 {
        0.0
    } else {
        bytes_downloaded as f64 / duration_secs as f64
    };

    let attempted = files_downloaded + files_failed;
    let success_rate = if attempted == 0 {
        0.0
    } else {
        files_downloaded as f64 / attempted as f64 * 100.0
    };

    Statistics {
        duration_secs,
        urls_discovered: state.discovered_urls.len(),
        files_found: files_downloaded + files_failed + files_skipped,
        files_downloaded,
        files_failed,
        files_skipped,
        bytes_downloaded,
        average_speed,
        success_rate,
        top_extensions: top_extensions(&state.downloaded, 5),
    }
}

/// The most frequent file extensions among the given records, lowercased,
/// descending by count then by name for a stable order.
fn top_extensions(records: &[DownloadRecord], limit: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in records {
        let name = record
            .url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        if let Some(idx) = name.rfind('.') {
            if idx > 0 && idx < name.len() - 1 {
                *counts.entry(name[idx + 1..].to_string()).or_insert(0) += 1;
            }
        }
    }
    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(limit);
    sorted
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn store() -> ProgressStore {
        ProgressStore::new(&url("http://example.com/files/"))
    }

    #[test]
    fn test_mark_discovered_dedups() {
        let s = store();
        assert!(s.mark_discovered("http://example.com/files/a/"));
        assert!(!s.mark_discovered("http://example.com/files/a/"));
        assert_eq!(s.snapshot().discovered_urls.len(), 1);
    }

    #[test]
    fn test_record_routes_by_status() {
        let s = store();
        let target = url("http://example.com/files/a.txt");
        s.record(DownloadRecord::succeeded(
            &target,
            Path::new("/out/a.txt"),
            100,
            250,
        ));
        s.record(DownloadRecord::failed(
            &url("http://example.com/files/b.txt"),
            "HTTP 500",
        ));
        s.record(DownloadRecord::skipped(
            &url("http://example.com/files/c.txt"),
            "extension filter",
        ));

        let snap = s.snapshot();
        assert_eq!(snap.downloaded.len(), 1);
        assert_eq!(snap.failed.len(), 1);
        assert_eq!(snap.skipped.len(), 1);
        assert!(s.is_downloaded(&target));
    }

    #[test]
    fn test_statistics_derived_from_records() {
        let s = store();
        s.mark_discovered("http://example.com/files/");
        s.record(DownloadRecord::succeeded(
            &url("http://example.com/files/a.txt"),
            Path::new("/out/a.txt"),
            100,
            10,
        ));
        s.record(DownloadRecord::succeeded(
            &url("http://example.com/files/b.pdf"),
            Path::new("/out/b.pdf"),
            200,
            20,
        ));
        s.record(DownloadRecord::failed(
            &url("http://example.com/files/c.txt"),
            "HTTP 404",
        ));

        let stats = s.statistics();
        assert_eq!(stats.urls_discovered, 1);
        assert_eq!(stats.files_found, 3);
        assert_eq!(stats.files_downloaded, 2);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.bytes_downloaded, 300);
        assert!((stats.success_rate - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_skipped_files_excluded_from_success_rate() {
        let s = store();
        s.record(DownloadRecord::skipped(
            &url("http://example.com/files/c.iso"),
            "extension filter",
        ));
        assert!((s.statistics().success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_top_extensions_ordering() {
        let records = vec![
            DownloadRecord::succeeded(&url("http://e.com/a.txt"), Path::new("/o/a.txt"), 1, 1),
            DownloadRecord::succeeded(&url("http://e.com/b.txt"), Path::new("/o/b.txt"), 1, 1),
            DownloadRecord::succeeded(&url("http://e.com/c.pdf"), Path::new("/o/c.pdf"), 1, 1),
            DownloadRecord::succeeded(&url("http://e.com/noext"), Path::new("/o/noext"), 1, 1),
        ];
        let top = top_extensions(&records, 5);
        assert_eq!(top, vec![("txt".to_string(), 2), ("pdf".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl_progress.json");

        let s = store();
        s.mark_discovered("http://example.com/files/");
        s.record(DownloadRecord::succeeded(
            &url("http://example.com/files/a.txt"),
            Path::new("/out/a.txt"),
            100,
            10,
        ));
        s.record(DownloadRecord::failed(
            &url("http://example.com/files/b.txt"),
            "HTTP 500",
        ));
        s.persist(&path).await.unwrap();

        let loaded = ProgressStore::load(&path).await.unwrap();
        assert_eq!(loaded.base_url, "http://example.com/files/");
        assert_eq!(loaded.discovered_urls.len(), 1);
        assert_eq!(loaded.downloaded.len(), 1);
        assert_eq!(loaded.failed.len(), 1);

        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_resume_short_circuits_only_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl_progress.json");

        let s = store();
        let done = url("http://example.com/files/a.txt");
        let failed = url("http://example.com/files/b.txt");
        s.record(DownloadRecord::succeeded(&done, Path::new("/out/a.txt"), 1, 1));
        s.record(DownloadRecord::failed(&failed, "HTTP 500"));
        s.persist(&path).await.unwrap();

        let resumed = ProgressStore::from_state(ProgressStore::load(&path).await.unwrap());
        assert!(resumed.is_downloaded(&done));
        assert!(!resumed.is_downloaded(&failed));
    }

    #[tokio::test]
    async fn test_resume_drops_stale_failed_and_skipped_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl_progress.json");

        let s = store();
        let retried = url("http://example.com/files/b.txt");
        s.record(DownloadRecord::failed(&retried, "HTTP 500"));
        s.record(DownloadRecord::skipped(
            &url("http://example.com/files/c.php"),
            "extension filter",
        ));
        s.persist(&path).await.unwrap();

        let resumed = ProgressStore::from_state(ProgressStore::load(&path).await.unwrap());
        // The re-attempt succeeds this run; only the fresh record may count.
        resumed.record(DownloadRecord::succeeded(
            &retried,
            Path::new("/out/b.txt"),
            1,
            1,
        ));

        let stats = resumed.statistics();
        assert_eq!(stats.files_downloaded, 1);
        assert_eq!(stats.files_failed, 0);
        assert_eq!(stats.files_skipped, 0);
        assert!((stats.success_rate - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let result = ProgressStore::load(Path::new("/nonexistent/progress.json")).await;
        assert!(matches!(result, Err(ProgressError::Io { .. })));
    }

    #[test]
    fn test_statistics_json_shape() {
        let s = store();
        let json = serde_json::to_value(s.statistics()).unwrap();
        assert!(json.get("files_downloaded").is_some());
        assert!(json.get("bytes_downloaded").is_some());
        assert!(json.get("success_rate").is_some());
    }
}
