//! Adaptive directory-listing parsing.
//!
//! Heterogeneous autoindex HTML (or plain text) goes in; a normalized list
//! of [`Entry`] values comes out. The [`profile`] submodule picks an
//! ordered strategy sequence per server family; [`strategy`] holds the
//! extraction strategies; this module drives the chain and validates the
//! result.
//!
//! The chain accepts the first strategy whose output survives validation:
//! every entry must resolve to an absolute URL under the directory's
//! authority and path prefix, and must not be the directory itself or its
//! parent. If no strategy produces a valid entry and the page does not
//! look like a listing shell at all, the directory is reported as
//! unrecognized - an unparsable page and an empty valid directory are
//! different outcomes.

pub mod profile;
pub mod strategy;

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, instrument, trace};
use url::Url;

pub use profile::{ProfileCache, ServerKind, ServerProfile, StrategyKind, detect};
pub use strategy::RawEntry;

/// Whether an entry is a downloadable file or a traversable subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One normalized file-or-directory item extracted from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Decoded display name (no trailing slash).
    pub name: String,
    /// Absolute URL, resolved against the directory it was listed in.
    pub url: Url,
    pub kind: EntryKind,
    /// Size in bytes, when the listing exposed one.
    pub size: Option<u64>,
    /// Raw modified-time string, when the listing exposed one.
    pub modified: Option<String>,
}

/// Errors from the listing parser chain.
#[derive(Debug, Error)]
pub enum ListingError {
    /// No strategy produced a plausible entry set and the page does not
    /// look like a directory listing.
    #[error("unrecognized listing format at {url}")]
    Unrecognized {
        /// The directory URL whose response could not be parsed.
        url: String,
    },
}

/// Parses a directory-listing body into entries using the profile's
/// strategy order.
///
/// # Errors
///
/// Returns [`ListingError::Unrecognized`] when every strategy comes up
/// empty and the body carries no listing indicators. A recognizable but
/// empty listing parses to `Ok(vec![])`.
#[instrument(skip(profile, body), fields(url = %dir_url, kind = ?profile.kind))]
pub fn parse_listing(
    dir_url: &Url,
    profile: &ServerProfile,
    body: &str,
) -> Result<Vec<Entry>, ListingError> {
    for kind in &profile.strategies {
        let raw = match kind {
            StrategyKind::Table => strategy::extract_table(body),
            StrategyKind::Anchors => strategy::extract_anchors(body),
            StrategyKind::Preformatted => strategy::extract_preformatted(body),
        };
        trace!(strategy = ?kind, raw = raw.len(), "strategy output");
        let entries = resolve_and_validate(dir_url, raw);
        if !entries.is_empty() {
            debug!(strategy = ?kind, entries = entries.len(), "accepted strategy");
            return Ok(entries);
        }
    }

    if looks_like_listing_shell(body) {
        debug!("listing shell with no entries, treating as empty directory");
        Ok(Vec::new())
    } else {
        Err(ListingError::Unrecognized {
            url: dir_url.to_string(),
        })
    }
}

/// Resolves raw hrefs against the directory URL and drops implausible
/// entries: off-authority or off-prefix URLs, and self/parent artifacts.
/// Duplicate URLs keep their first occurrence (extraction order).
fn resolve_and_validate(dir_url: &Url, raw: Vec<RawEntry>) -> Vec<Entry> {
    let prefix = directory_prefix(dir_url);
    let mut seen: HashSet<String> = HashSet::new();
    let mut entries = Vec::new();

    for item in raw {
        let Ok(resolved) = dir_url.join(&item.href) else {
            continue;
        };
        if !is_confined(dir_url, &prefix, &resolved) {
            continue;
        }
        if is_self_or_parent(dir_url, &resolved) {
            continue;
        }
        if !seen.insert(resolved.as_str().to_string()) {
            continue;
        }

        let kind = if resolved.path().ends_with('/') {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let name = entry_name(&resolved, &item.name);

        entries.push(Entry {
            name,
            url: resolved,
            kind,
            size: item.size,
            modified: item.modified,
        });
    }
    entries
}

/// The directory URL's path with a guaranteed trailing slash.
fn directory_prefix(dir_url: &Url) -> String {
    let path = dir_url.path();
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// An entry is confined when it shares the directory's scheme and
/// authority and its path sits under the directory's path prefix.
fn is_confined(dir_url: &Url, prefix: &str, candidate: &Url) -> bool {
    candidate.scheme() == dir_url.scheme()
        && candidate.host_str() == dir_url.host_str()
        && candidate.port_or_known_default() == dir_url.port_or_known_default()
        && candidate.path().starts_with(prefix)
}

/// Excludes the directory's own URL and its parent, slash-insensitively -
/// sort variants and self links frequently resolve back to either.
fn is_self_or_parent(dir_url: &Url, candidate: &Url) -> bool {
    let dir_path = dir_url.path().trim_end_matches('/');
    let cand_path = candidate.path().trim_end_matches('/');
    if cand_path == dir_path {
        return true;
    }
    let parent = match dir_path.rfind('/') {
        Some(idx) => &dir_path[..idx],
        None => "",
    };
    cand_path == parent
}

/// Derives the display name from the URL's last path segment,
/// percent-decoded, falling back to the extracted link text.
fn entry_name(url: &Url, extracted: &str) -> String {
    let path = url.path().trim_end_matches('/');
    let segment = path.rsplit('/').next().unwrap_or_default();
    if segment.is_empty() {
        return extracted.to_string();
    }
    urlencoding::decode(segment)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Indicators that a page is a directory listing shell even when no rows
/// were extracted (distinguishes an empty directory from an arbitrary
/// non-listing page). Also used to warn when the root URL does not look
/// like a listing at all.
#[must_use]
pub fn looks_like_listing_shell(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("index of")
        || lower.contains("directory listing")
        || lower.contains("parent directory")
        || lower.contains("[to parent directory]")
        || lower.contains("autoindex")
        || lower.contains("<pre")
}
