//! Listing extraction strategies.
//!
//! Each strategy is a pure function from a response body to raw entries
//! (href + name + best-effort size/date). The chain driver in the parent
//! module resolves hrefs against the directory URL and validates the
//! result; strategies only extract.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

/// An extracted-but-unresolved listing item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// The raw href, relative or absolute, as found in the page.
    pub href: String,
    /// Display name (may differ from the href for encoded paths).
    pub name: String,
    /// Size in bytes when the listing exposes one.
    pub size: Option<u64>,
    /// Raw modified-time string when the listing exposes one.
    pub modified: Option<String>,
}

impl RawEntry {
    fn new(href: &str, name: &str) -> Self {
        Self {
            href: href.to_string(),
            name: name.trim().trim_end_matches('/').to_string(),
            size: None,
            modified: None,
        }
    }
}

// Selector and regex patterns are static and known-valid; a parse failure
// here is a programming error, not a runtime condition.
#[allow(clippy::expect_used)]
fn selector(src: &'static str) -> Selector {
    Selector::parse(src).expect("static selector must parse")
}

#[allow(clippy::expect_used)]
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Apache "2024-01-15 10:30", IIS "1/15/2024 10:30 AM", "15-Jan-2024 10:30"
    Regex::new(r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}|\d{1,2}/\d{1,2}/\d{4}(?:\s+\d{1,2}:\d{2}(?:\s*[AP]M)?)?|\d{1,2}-[A-Za-z]{3}-\d{4}(?:\s+\d{2}:\d{2})?")
        .expect("static regex must compile")
});

#[allow(clippy::expect_used)]
static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)\s*([KMGT]i?B?|B)?$").expect("static regex must compile")
});

#[allow(clippy::expect_used)]
static IIS_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    // " 1/15/2024  10:30 AM       <dir> sub" / " 1/15/2024  10:30 AM        1024 a.txt"
    Regex::new(r"(?im)^\s*(\d{1,2}/\d{1,2}/\d{4}\s+\d{1,2}:\d{2}(?:\s*[AP]M)?)\s+(<dir>|\d+)\s+(\S.*?)\s*$")
        .expect("static regex must compile")
});

#[allow(clippy::expect_used)]
static UNIX_LS_RE: LazyLock<Regex> = LazyLock::new(|| {
    // "-rw-r--r--  1 ftp ftp  1024 Jan 15 10:30 a.txt"
    Regex::new(r"(?m)^([-dl])[rwxstST-]{9}\s+\d+\s+\S+\s+\S+\s+(\d+)\s+(\w{3}\s+\d{1,2}\s+[\d:]{4,5})\s+(\S.*?)\s*$")
        .expect("static regex must compile")
});

/// Returns whether an href is a candidate listing entry at all.
///
/// Excludes self/parent references, sort-toggle and query-only links,
/// fragments, and non-HTTP schemes. Absolute http(s) hrefs stay in; the
/// validation pass rejects them if they leave the directory's authority
/// or path prefix.
pub fn is_candidate_href(href: &str) -> bool {
    if href.is_empty() {
        return false;
    }
    if matches!(href, "../" | ".." | "./" | "." | "/") {
        return false;
    }
    if href.starts_with('#') || href.starts_with('?') {
        return false;
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("mailto:")
        || lower.starts_with("javascript:")
        || lower.starts_with("ftp:")
        || lower.starts_with("tel:")
        || lower.starts_with("data:")
    {
        return false;
    }
    true
}

/// Structured-table strategy: rows with a link cell plus size/date cells.
///
/// Covers Apache fancy indexing and IIS table mode; extracts size and
/// modified time when the neighboring cells carry them.
#[must_use]
pub fn extract_table(body: &str) -> Vec<RawEntry> {
    let doc = Html::parse_document(body);
    let row_sel = selector("table tr");
    let link_sel = selector("a[href]");
    let cell_sel = selector("td, th");

    let mut entries = Vec::new();
    for row in doc.select(&row_sel) {
        let Some(link) = row.select(&link_sel).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if !is_candidate_href(href) {
            continue;
        }

        let name: String = link.text().collect();
        if name.trim().is_empty() {
            continue;
        }
        let mut entry = RawEntry::new(href, &name);

        for cell in row.select(&cell_sel) {
            let text: String = cell.text().collect();
            let text = text.trim();
            if entry.size.is_none() {
                if let Some(size) = parse_size(text) {
                    entry.size = Some(size);
                }
            }
            if entry.modified.is_none() {
                if let Some(m) = DATE_RE.find(text) {
                    entry.modified = Some(m.as_str().to_string());
                }
            }
        }

        entries.push(entry);
    }
    entries
}

/// Generic anchor-extraction strategy: every hyperlink in the body,
/// filtered down to plausible entry links.
#[must_use]
pub fn extract_anchors(body: &str) -> Vec<RawEntry> {
    let doc = Html::parse_document(body);
    let link_sel = selector("a[href]");

    let mut entries = Vec::new();
    for link in doc.select(&link_sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if !is_candidate_href(href) {
            continue;
        }
        let text: String = link.text().collect();
        let name = if text.trim().is_empty() {
            href.to_string()
        } else {
            text
        };
        entries.push(RawEntry::new(href, &name));
    }
    entries
}

/// Pattern-based strategy for pre-formatted and plain-text listings:
/// IIS text mode and ftp-style `ls -l` dumps.
#[must_use]
pub fn extract_preformatted(body: &str) -> Vec<RawEntry> {
    let text = pre_text(body);

    let mut entries = Vec::new();
    for caps in IIS_TEXT_RE.captures_iter(&text) {
        let name = &caps[3];
        if name == "." || name == ".." {
            continue;
        }
        let is_dir = caps[2].eq_ignore_ascii_case("<dir>");
        let href = if is_dir {
            format!("{name}/")
        } else {
            name.to_string()
        };
        let mut entry = RawEntry::new(&href, name);
        entry.modified = Some(caps[1].to_string());
        if !is_dir {
            entry.size = caps[2].parse().ok();
        }
        entries.push(entry);
    }
    if !entries.is_empty() {
        return entries;
    }

    for caps in UNIX_LS_RE.captures_iter(&text) {
        let name = &caps[4];
        if name == "." || name == ".." {
            continue;
        }
        let is_dir = &caps[1] == "d";
        let href = if is_dir {
            format!("{name}/")
        } else {
            name.to_string()
        };
        let mut entry = RawEntry::new(&href, name);
        entry.modified = Some(caps[3].to_string());
        if !is_dir {
            entry.size = caps[2].parse().ok();
        }
        entries.push(entry);
    }
    entries
}

/// Extracts `<pre>` contents when present, otherwise returns the body as-is
/// (bare plain-text listings carry no markup at all).
fn pre_text(body: &str) -> String {
    if body.contains("<pre") {
        let doc = Html::parse_document(body);
        let pre_sel = selector("pre");
        let collected: String = doc
            .select(&pre_sel)
            .flat_map(|pre| pre.text())
            .collect();
        if !collected.is_empty() {
            return collected;
        }
    }
    body.to_string()
}

/// Parses a human-formatted size column value ("1234", "1.5K", "23M", "-").
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(text)?;
    let value: f64 = caps[1].parse().ok()?;
    let multiplier: f64 = match caps.get(2).map(|m| m.as_str().chars().next()) {
        Some(Some('K')) => 1024.0,
        Some(Some('M')) => 1024.0 * 1024.0,
        Some(Some('G')) => 1024.0 * 1024.0 * 1024.0,
        Some(Some('T')) => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    Some((value * multiplier) as u64)
}
