//! HTTP client wrapper for listing fetches and streaming file downloads.
//!
//! Owns a configured `reqwest::Client` (User-Agent, request timeout,
//! SSL-verification toggle, gzip decompression) shared by the discovery
//! engine and the download workers.
//!
//! Downloads stream the response body to a `.part` file that is renamed
//! into place only after the stream completes, so an interrupted or failed
//! download never leaves a truncated file at the final path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER, SERVER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::FetchError;

/// A directory-listing response with the metadata profile detection needs.
#[derive(Debug, Clone)]
pub struct ListingResponse {
    /// The URL after redirects.
    pub final_url: Url,
    /// The `Server` response header, if present.
    pub server: Option<String>,
    /// The `Content-Type` response header, if present.
    pub content_type: Option<String>,
    /// The response body.
    pub body: String,
}

/// HTTP client for crawl and download requests.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a client from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Build`] if the underlying client cannot be
    /// constructed (e.g. TLS backend initialization failure).
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), verify_ssl))]
    pub fn new(user_agent: &str, timeout: Duration, verify_ssl: bool) -> Result<Self, FetchError> {
        if !verify_ssl {
            warn!("SSL certificate verification disabled");
        }
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl)
            .gzip(true)
            .build()
            .map_err(FetchError::Build)?;
        Ok(Self { client })
    }

    /// Fetches a directory-listing page, returning body and the response
    /// metadata used for server-profile detection.
    ///
    /// # Errors
    ///
    /// Returns `FetchError` on network errors, timeouts, and non-2xx
    /// responses (with Retry-After captured for 429/503).
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_listing(&self, url: &Url) -> Result<ListingResponse, FetchError> {
        let response = self.send_get(url).await?;

        let final_url = response.url().clone();
        let server = header_string(response.headers(), SERVER.as_str());
        let content_type = header_string(response.headers(), CONTENT_TYPE.as_str());

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::network(url.as_str(), e))?;

        debug!(bytes = body.len(), "fetched listing body");

        Ok(ListingResponse {
            final_url,
            server,
            content_type,
            body,
        })
    }

    /// Downloads a file to `dest`, creating parent directories as needed.
    ///
    /// The body streams into `<dest>.part`, which is renamed to `dest` on
    /// success. On any failure the partial file is removed; the final path
    /// is never left truncated.
    ///
    /// # Errors
    ///
    /// Returns `FetchError` on network errors, timeouts, non-2xx
    /// responses, and local IO failures.
    #[must_use = "the byte count feeds the download record"]
    #[instrument(skip(self), fields(url = %url, dest = %dest.display()))]
    pub async fn download(&self, url: &Url, dest: &Path) -> Result<u64, FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent.to_path_buf(), e))?;
        }

        let response = self.send_get(url).await?;

        let part_path = part_path_for(dest);
        let file = File::create(&part_path)
            .await
            .map_err(|e| FetchError::io(part_path.clone(), e))?;

        let stream_result = stream_to_file(file, response, url, &part_path).await;

        let bytes = match stream_result {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %part_path.display(), "removing partial file after error");
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&part_path, dest).await.map_err(|e| {
            let _ = std::fs::remove_file(&part_path);
            FetchError::io(dest.to_path_buf(), e)
        })?;

        info!(path = %dest.display(), bytes, "download complete");
        Ok(bytes)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn send_get(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url.as_str())
            } else {
                FetchError::network(url.as_str(), e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = header_string(response.headers(), RETRY_AFTER.as_str());
            return Err(FetchError::http_status_with_retry_after(
                url.as_str(),
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Appends `.part` to the destination file name.
fn part_path_for(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

/// Streams the response body to the open file, returning bytes written.
///
/// Extracted so the caller can clean up the partial file on error; the
/// file handle is dropped (and flushed) on every exit path.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &Url,
    path: &Path,
) -> Result<u64, FetchError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| FetchError::network(url.as_str(), e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(path.to_path_buf(), e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| FetchError::io(path.to_path_buf(), e))?;

    Ok(bytes_written)
}
