//! Mapping from remote file URLs to local destination paths.
//!
//! Local paths mirror the remote directory structure relative to the root
//! URL. Assignment happens on the discovery side (which is order-stable),
//! so path assignments - including collision suffixes - are deterministic
//! for a given tree and never drift between runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

/// Fallback file name when a URL yields no usable path segment.
const FALLBACK_NAME: &str = "download.bin";

/// Assigns local destination paths for discovered file URLs.
#[derive(Debug)]
pub struct DestMapper {
    /// Path prefix of the root URL (always ends with '/').
    base_path: String,
    output_dir: PathBuf,
    /// Already-assigned paths, keyed by path with the claiming URL as value.
    claimed: HashMap<PathBuf, String>,
}

impl DestMapper {
    /// Creates a mapper rooted at the given base URL and output directory.
    #[must_use]
    pub fn new(base: &Url, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_path: directory_path(base),
            output_dir: output_dir.into(),
            claimed: HashMap::new(),
        }
    }

    /// Assigns the local path for a file URL.
    ///
    /// Two distinct remote URLs that would map to the same local path get
    /// distinct paths: the second receives a suffix derived from a stable
    /// hash of its full URL, so neither overwrites the other and the
    /// assignment repeats identically across runs.
    pub fn assign(&mut self, url: &Url) -> PathBuf {
        let candidate = self.map_path(url);

        match self.claimed.get(&candidate) {
            Some(owner) if owner != url.as_str() => {
                let suffixed = with_url_suffix(&candidate, url);
                debug!(
                    url = %url,
                    path = %suffixed.display(),
                    "local path collision, applying hash suffix"
                );
                self.claimed
                    .insert(suffixed.clone(), url.as_str().to_string());
                suffixed
            }
            _ => {
                self.claimed
                    .insert(candidate.clone(), url.as_str().to_string());
                candidate
            }
        }
    }

    fn map_path(&self, url: &Url) -> PathBuf {
        let path = url.path();
        let relative = path.strip_prefix(&self.base_path).unwrap_or_else(|| {
            // Entry outside the base prefix should have been rejected by
            // listing validation; fall back to the full path.
            path.trim_start_matches('/')
        });

        let mut dest = self.output_dir.clone();
        let mut pushed = false;
        for segment in relative.split('/') {
            if segment.is_empty() {
                continue;
            }
            let decoded = urlencoding::decode(segment)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            let clean = sanitize_component(&decoded);
            if clean.is_empty() {
                continue;
            }
            dest.push(clean);
            pushed = true;
        }
        if !pushed {
            dest.push(FALLBACK_NAME);
        }
        dest
    }
}

/// Returns the directory portion of a URL path, with a trailing slash.
fn directory_path(url: &Url) -> String {
    let path = url.path();
    if path.ends_with('/') {
        path.to_string()
    } else {
        match path.rfind('/') {
            Some(idx) => path[..=idx].to_string(),
            None => "/".to_string(),
        }
    }
}

/// Sanitizes one path segment for local use.
///
/// Separators, control characters, and Windows-unsafe characters become
/// underscores; `.` and `..` segments are neutralized to keep every
/// destination under the output root.
fn sanitize_component(segment: &str) -> String {
    if segment == "." || segment == ".." {
        return "_".to_string();
    }
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_matches(char::is_whitespace).to_string()
}

/// Appends an 8-hex-digit hash of the full URL before the extension.
fn with_url_suffix(path: &Path, url: &Url) -> PathBuf {
    let digest = Sha256::digest(url.as_str().as_bytes());
    let tag: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(FALLBACK_NAME);
    let new_name = match file_name.rfind('.') {
        Some(idx) if idx > 0 => {
            format!("{}-{tag}{}", &file_name[..idx], &file_name[idx..])
        }
        _ => format!("{file_name}-{tag}"),
    };
    path.with_file_name(new_name)
}
