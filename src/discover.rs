//! Breadth-first directory discovery.
//!
//! Walks the remote tree from the root URL, one directory at a time, and
//! feeds discovered files into the bounded intake channel. The traversal
//! is order-stable: directories are visited in the order they were found
//! and a directory's files are emitted in listing order, so destination
//! path assignment (which happens here, not in the workers) is
//! deterministic for a given tree.
//!
//! Gates run in a fixed order per directory: visited-dedup, depth bound,
//! robots policy, rate-limit delay. Rejections are recorded as skips;
//! fetch and parse failures are recorded and prune the subtree without
//! stopping the run.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::fetch::rate_limiter::{authority_key, parse_retry_after};
use crate::fetch::retry::{RetryDecision, RetryPolicy, classify_error};
use crate::fetch::{
    DestMapper, FetchError, FileTask, HttpClient, ListingResponse, RateLimiter, RobotsDecision,
    RobotsPolicy,
};
use crate::listing::{EntryKind, ProfileCache, parse_listing};
use crate::progress::{DownloadRecord, ProgressStore};
use crate::shutdown::ShutdownToken;

/// How much of the body profile detection looks at.
const PROFILE_PREFIX_CHARS: usize = 2048;

/// Path extensions that indicate dynamically generated content.
const DYNAMIC_EXTENSIONS: &[&str] = &["php", "asp", "aspx", "jsp", "cgi"];

/// Extensions that identify a document even when the URL carries a query.
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "csv", "zip", "tar", "gz", "iso",
];

/// One directory to visit.
#[derive(Debug, Clone)]
pub struct CrawlTarget {
    pub url: Url,
    pub depth: u32,
}

enum FetchOutcome {
    Ok(ListingResponse),
    Failed(FetchError),
    Cancelled,
}

/// The discovery stage of a crawl.
pub struct Discovery {
    client: HttpClient,
    limiter: Arc<RateLimiter>,
    store: Arc<ProgressStore>,
    token: ShutdownToken,
    policy: RetryPolicy,
    mapper: DestMapper,
    robots: RobotsPolicy,
    profiles: ProfileCache,
    max_depth: u32,
    ignore_robots: bool,
}

impl Discovery {
    #[must_use]
    pub fn new(
        client: HttpClient,
        limiter: Arc<RateLimiter>,
        store: Arc<ProgressStore>,
        token: ShutdownToken,
        policy: RetryPolicy,
        mapper: DestMapper,
    ) -> Self {
        Self {
            client,
            limiter,
            store,
            token,
            policy,
            mapper,
            robots: RobotsPolicy::new(),
            profiles: ProfileCache::new(),
            max_depth: 10,
            ignore_robots: false,
        }
    }

    #[must_use]
    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    #[must_use]
    pub fn ignore_robots(mut self, ignore: bool) -> Self {
        self.ignore_robots = ignore;
        self
    }

    /// Runs the breadth-first traversal from `root`, sending file tasks on
    /// `tx`. Dropping `tx` at the end is the completion signal for the
    /// download stage.
    #[instrument(skip_all, fields(root = %root))]
    pub async fn run(mut self, root: Url, tx: mpsc::Sender<FileTask>) {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<CrawlTarget> = VecDeque::new();
        queue.push_back(CrawlTarget {
            url: ensure_dir_url(root),
            depth: 0,
        });

        'crawl: while let Some(target) = queue.pop_front() {
            if self.token.is_triggered() {
                info!("shutdown requested, stopping discovery");
                break;
            }
            if !visited.insert(normalize_url(&target.url)) {
                continue;
            }
            self.store.mark_discovered(target.url.as_str());

            if target.depth > self.max_depth {
                debug!(url = %target.url, depth = target.depth, "depth limit");
                self.store
                    .record(DownloadRecord::skipped(&target.url, "depth limit"));
                continue;
            }

            if !self.ignore_robots
                && self.robots.check_allowed(&target.url, &self.client).await
                    == RobotsDecision::Disallowed
            {
                debug!(url = %target.url, "disallowed by robots.txt");
                self.store
                    .record(DownloadRecord::skipped(&target.url, "robots.txt disallowed"));
                continue;
            }

            tokio::select! {
                () = self.limiter.acquire(&target.url) => {}
                () = self.token.cancelled() => break,
            }

            let response = match self.fetch_with_retries(&target.url).await {
                FetchOutcome::Ok(response) => response,
                FetchOutcome::Cancelled => break,
                FetchOutcome::Failed(error) => {
                    warn!(url = %target.url, %error, "directory fetch failed");
                    self.store
                        .record(DownloadRecord::failed(&target.url, error.to_string()));
                    continue;
                }
            };

            let dir_url = ensure_dir_url(response.final_url.clone());
            let profile = self.profiles.profile_for(
                &authority_key(&dir_url),
                response.server.as_deref(),
                body_prefix(&response.body),
            );

            let entries = match parse_listing(&dir_url, &profile, &response.body) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(url = %target.url, %error, "unparsable directory, pruning subtree");
                    self.store
                        .record(DownloadRecord::failed(&target.url, error.to_string()));
                    continue;
                }
            };
            debug!(url = %dir_url, entries = entries.len(), depth = target.depth, "directory listed");

            for entry in entries {
                match entry.kind {
                    EntryKind::Directory => {
                        queue.push_back(CrawlTarget {
                            url: ensure_dir_url(entry.url),
                            depth: target.depth + 1,
                        });
                    }
                    EntryKind::File => {
                        if !visited.insert(normalize_url(&entry.url)) {
                            continue;
                        }
                        self.store.mark_discovered(entry.url.as_str());

                        if is_dynamic_content(&entry.url) {
                            debug!(url = %entry.url, "skipping dynamic content");
                            self.store
                                .record(DownloadRecord::skipped(&entry.url, "dynamic content"));
                            continue;
                        }

                        let dest = self.mapper.assign(&entry.url);
                        let task = FileTask {
                            url: entry.url,
                            dest,
                            size: entry.size,
                        };
                        if tx.send(task).await.is_err() {
                            // All workers are gone; nothing left to feed.
                            break 'crawl;
                        }
                    }
                }
            }
        }
        info!("discovery finished");
    }

    /// Fetches a listing with bounded retries, honoring Retry-After.
    async fn fetch_with_retries(&self, url: &Url) -> FetchOutcome {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.client.fetch_listing(url).await {
                Ok(response) => return FetchOutcome::Ok(response),
                Err(error) => {
                    if let FetchError::HttpStatus {
                        retry_after: Some(value),
                        ..
                    } = &error
                        && let Some(delay) = parse_retry_after(value)
                    {
                        self.limiter.record_rate_limit(url, delay);
                    }
                    match self.policy.should_retry(classify_error(&error), attempt) {
                        RetryDecision::Retry { delay, .. } => {
                            debug!(url = %url, attempt, %error, "listing fetch failed, retrying");
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = self.token.cancelled() => return FetchOutcome::Cancelled,
                            }
                        }
                        RetryDecision::DoNotRetry { .. } => return FetchOutcome::Failed(error),
                    }
                }
            }
        }
    }
}

/// Guarantees a trailing slash so relative hrefs resolve inside the
/// directory rather than beside it.
fn ensure_dir_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Normalized key for traversal dedup: lowercased authority, decoded
/// path without the trailing slash, plus any query.
fn normalize_url(url: &Url) -> String {
    let decoded = urlencoding::decode(url.path())
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| url.path().to_string());
    let path = decoded.trim_end_matches('/');
    match url.query() {
        Some(query) => format!("{}{}?{}", authority_key(url), path, query),
        None => format!("{}{}", authority_key(url), path),
    }
}

fn body_prefix(body: &str) -> &str {
    match body.char_indices().nth(PROFILE_PREFIX_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Whether a file URL points at dynamically generated content rather than
/// a static file. Query-carrying URLs still count as documents when the
/// path has a well-known document extension.
fn is_dynamic_content(url: &Url) -> bool {
    let ext = path_extension(url);
    if let Some(ext) = &ext
        && DYNAMIC_EXTENSIONS.contains(&ext.as_str())
    {
        return true;
    }
    if url.query().is_some() {
        return !ext.is_some_and(|e| DOCUMENT_EXTENSIONS.contains(&e.as_str()));
    }
    false
}

fn path_extension(url: &Url) -> Option<String> {
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

    #[test]
    fn test_ensure_dir_url_adds_slash() {
        assert_eq!(
            ensure_dir_url(url("http://e.com/files")).as_str(),
            "http://e.com/files/"
        );
        assert_eq!(
            ensure_dir_url(url("http://e.com/files/")).as_str(),
            "http://e.com/files/"
        );
    }

    #[test]
    fn test_normalize_url_slash_and_encoding_insensitive() {
        let a = normalize_url(&url("http://E.com/files/sub/"));
        let b = normalize_url(&url("http://e.com/files/sub"));
        let c = normalize_url(&url("http://e.com/files/%73ub"));
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_normalize_url_keeps_query_distinct() {
        let plain = normalize_url(&url("http://e.com/f/a.pdf"));
        let query = normalize_url(&url("http://e.com/f/a.pdf?v=2"));
        assert_ne!(plain, query);
    }

    #[test]
    fn test_dynamic_content_detection() {
        assert!(is_dynamic_content(&url("http://e.com/download.php")));
        assert!(is_dynamic_content(&url("http://e.com/list?sort=name")));
        assert!(!is_dynamic_content(&url("http://e.com/report.pdf?v=2")));
        assert!(!is_dynamic_content(&url("http://e.com/report.pdf")));
    }

    fn discovery_for(server: &MockServer) -> (Discovery, Arc<ProgressStore>) {
        let base = url(&format!("{}/files/", server.uri()));
        let store = Arc::new(ProgressStore::new(&base));
        let client = HttpClient::new("test-agent/1.0", Duration::from_secs(10), true).unwrap();
        let discovery = Discovery::new(
            client,
            Arc::new(RateLimiter::new(Duration::ZERO)),
            Arc::clone(&store),
            ShutdownToken::new(),
            RetryPolicy::with_max_attempts(1),
            DestMapper::new(&base, "/out"),
        )
        .ignore_robots(true);
        (discovery, store)
    }

    async fn collect_tasks(mut rx: mpsc::Receiver<FileTask>) -> Vec<FileTask> {
        let mut tasks = Vec::new();
        while let Some(task) = rx.recv().await {
            tasks.push(task);
        }
        tasks
    }

    #[tokio::test]
    async fn test_two_level_traversal_emits_files_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<h1>Index of /files/</h1><pre><a href="a.txt">a.txt</a>
<a href="sub/">sub/</a></pre>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/sub/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<h1>Index of /files/sub/</h1><pre><a href="b.pdf">b.pdf</a></pre>"#,
            ))
            .mount(&server)
            .await;

        let (discovery, _store) = discovery_for(&server);
        let (tx, rx) = mpsc::channel(16);
        let root = url(&format!("{}/files/", server.uri()));

        let (_, tasks) = tokio::join!(discovery.run(root, tx), collect_tasks(rx));

        let names: Vec<String> = tasks
            .iter()
            .map(|t| t.url.path().to_string())
            .collect();
        assert_eq!(names, vec!["/files/a.txt", "/files/sub/b.pdf"]);
        assert_eq!(tasks[0].dest, std::path::PathBuf::from("/out/a.txt"));
        assert_eq!(tasks[1].dest, std::path::PathBuf::from("/out/sub/b.pdf"));
    }

    #[tokio::test]
    async fn test_depth_bound_records_skip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<h1>Index of /files/</h1><pre><a href="deep/">deep/</a></pre>"#,
            ))
            .mount(&server)
            .await;
        // The subdirectory must never be fetched at depth 0.
        Mock::given(method("GET"))
            .and(path("/files/deep/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (discovery, store) = discovery_for(&server);
        let (tx, rx) = mpsc::channel(16);
        let root = url(&format!("{}/files/", server.uri()));

        let (_, tasks) = tokio::join!(discovery.max_depth(0).run(root, tx), collect_tasks(rx));

        assert!(tasks.is_empty());
        let snap = store.snapshot();
        assert_eq!(snap.skipped.len(), 1);
        assert_eq!(snap.skipped[0].error.as_deref(), Some("depth limit"));
    }

    #[tokio::test]
    async fn test_unrecognized_listing_recorded_and_pruned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"error": "no listing here"}"#),
            )
            .mount(&server)
            .await;

        let (discovery, store) = discovery_for(&server);
        let (tx, rx) = mpsc::channel(16);
        let root = url(&format!("{}/files/", server.uri()));

        let (_, tasks) = tokio::join!(discovery.run(root, tx), collect_tasks(rx));

        assert!(tasks.is_empty());
        let snap = store.snapshot();
        assert_eq!(snap.failed.len(), 1);
        assert!(
            snap.failed[0]
                .error
                .as_deref()
                .unwrap()
                .contains("unrecognized")
        );
    }

    #[tokio::test]
    async fn test_robots_disallow_records_skip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("User-agent: *\nDisallow: /files/private/\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<h1>Index of /files/</h1><pre><a href="private/">private/</a></pre>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/private/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let server_base = url(&format!("{}/files/", server.uri()));
        let store = Arc::new(ProgressStore::new(&server_base));
        let client = HttpClient::new("test-agent/1.0", Duration::from_secs(10), true).unwrap();
        let discovery = Discovery::new(
            client,
            Arc::new(RateLimiter::new(Duration::ZERO)),
            Arc::clone(&store),
            ShutdownToken::new(),
            RetryPolicy::with_max_attempts(1),
            DestMapper::new(&server_base, "/out"),
        );

        let (tx, rx) = mpsc::channel(16);
        let (_, tasks) = tokio::join!(discovery.run(server_base, tx), collect_tasks(rx));

        assert!(tasks.is_empty());
        let snap = store.snapshot();
        assert_eq!(snap.skipped.len(), 1);
        assert_eq!(
            snap.skipped[0].error.as_deref(),
            Some("robots.txt disallowed")
        );
    }

    #[tokio::test]
    async fn test_dynamic_content_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<h1>Index of /files/</h1><pre><a href="download.php">download.php</a>
<a href="a.txt">a.txt</a></pre>"#,
            ))
            .mount(&server)
            .await;

        let (discovery, store) = discovery_for(&server);
        let (tx, rx) = mpsc::channel(16);
        let root = url(&format!("{}/files/", server.uri()));

        let (_, tasks) = tokio::join!(discovery.run(root, tx), collect_tasks(rx));

        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].url.path().ends_with("a.txt"));
        let snap = store.snapshot();
        assert_eq!(snap.skipped.len(), 1);
        assert_eq!(snap.skipped[0].error.as_deref(), Some("dynamic content"));
    }
}
