//! Minimal robots.txt fetching and parsing for polite crawling.
//!
//! Supports `User-agent: *` and `Disallow: /path` prefix rules, cached per
//! authority for the lifetime of the run. A missing (404) robots.txt and
//! fetch failures both allow crawling, matching the permissive behavior
//! expected of a directory-listing tool.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument, warn};
use url::Url;

use super::client::HttpClient;
use super::rate_limiter::authority_key;

/// Result of checking a URL against robots.txt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsDecision {
    /// URL is allowed.
    Allowed,
    /// URL is disallowed by robots.txt.
    Disallowed,
}

/// Per-authority robots.txt checker.
#[derive(Debug, Default)]
pub struct RobotsPolicy {
    cache: DashMap<String, Arc<Vec<String>>>,
}

impl RobotsPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Returns whether the URL is allowed by its authority's robots.txt.
    ///
    /// Fetches robots.txt at most once per authority; fetch failures and
    /// 404 responses allow everything.
    #[instrument(skip(self, client), fields(url = %url))]
    pub async fn check_allowed(&self, url: &Url, client: &HttpClient) -> RobotsDecision {
        let authority = authority_key(url);

        let rules = if let Some(cached) = self.cache.get(&authority) {
            Arc::clone(&cached)
        } else {
            let rules = Arc::new(self.fetch_rules(url, client).await);
            self.cache.insert(authority.clone(), Arc::clone(&rules));
            rules
        };

        let path = url.path();
        if rules.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            debug!(path = %path, authority = %authority, "robots.txt disallows path");
            RobotsDecision::Disallowed
        } else {
            RobotsDecision::Allowed
        }
    }

    async fn fetch_rules(&self, url: &Url, client: &HttpClient) -> Vec<String> {
        let Some(robots_url) = url.join("/robots.txt").ok() else {
            return Vec::new();
        };

        let response = match client.inner().get(robots_url.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %robots_url, error = %e, "robots.txt fetch failed, allowing all");
                return Vec::new();
            }
        };

        if !response.status().is_success() {
            debug!(
                url = %robots_url,
                status = response.status().as_u16(),
                "no usable robots.txt, allowing all"
            );
            return Vec::new();
        }

        match response.text().await {
            Ok(body) => parse_disallow_rules(&body),
            Err(e) => {
                warn!(url = %robots_url, error = %e, "robots.txt body read failed, allowing all");
                Vec::new()
            }
        }
    }
}

/// Parses a robots.txt body for `User-agent: *` `Disallow` rules.
fn parse_disallow_rules(body: &str) -> Vec<String> {
    let mut in_star = false;
    let mut disallowed: Vec<String> = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("User-agent:") {
            let rest = rest.trim();
            in_star = rest == "*" || rest.is_empty();
            continue;
        }
        if in_star {
            if let Some(suffix) = line.strip_prefix("Disallow:") {
                let path = suffix.trim();
                if path.is_empty() {
                    continue;
                }
                let prefix = normalize_disallow_path(path);
                if !prefix.is_empty() && !disallowed.contains(&prefix) {
                    disallowed.push(prefix);
                }
            }
        }
    }
    disallowed
}

fn normalize_disallow_path(path: &str) -> String {
    let s = path.trim();
    if s.is_empty() {
        return String::new();
    }
    let mut s = s.to_string();
    if !s.starts_with('/') {
        s.insert(0, '/');
    }
    s
}
