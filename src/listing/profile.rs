//! Server profile detection for listing-parser selection.
//!
//! Inspects the `Server` response header and a prefix of the body to guess
//! which server family generated a directory listing, and orders the
//! parsing strategies accordingly. Detection is cached per authority
//! (host:port): the first detection wins for the rest of the run, so an
//! ambiguous page later on cannot oscillate the profile.

use dashmap::DashMap;
use tracing::{debug, instrument};

/// Server software family inferred from a listing response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Apache,
    Nginx,
    Iis,
    PythonSimple,
    Generic,
    Unknown,
}

/// A parsing strategy identifier, tried in profile order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Structured name/modified/size tables (Apache fancy-index, IIS table mode).
    Table,
    /// All anchors in the body, filtered (every autoindex variant links entries).
    Anchors,
    /// Regex over pre-formatted or plain text (IIS text mode, ftp-style dumps).
    Preformatted,
}

/// Detected server family plus the ordered strategies to attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProfile {
    pub kind: ServerKind,
    pub strategies: Vec<StrategyKind>,
}

impl ServerProfile {
    fn for_kind(kind: ServerKind) -> Self {
        use StrategyKind::{Anchors, Preformatted, Table};
        let strategies = match kind {
            ServerKind::Apache => vec![Table, Anchors, Preformatted],
            ServerKind::Nginx | ServerKind::PythonSimple => vec![Anchors, Table, Preformatted],
            ServerKind::Iis => vec![Table, Preformatted, Anchors],
            ServerKind::Generic | ServerKind::Unknown => vec![Table, Anchors, Preformatted],
        };
        Self { kind, strategies }
    }
}

/// Detects the server profile from response metadata.
///
/// Heuristics in order, first match wins: `Server` header tokens, then
/// body signatures, then `Unknown` (full generic strategy sequence).
#[must_use]
#[instrument(skip(body_prefix))]
pub fn detect(server_header: Option<&str>, body_prefix: &str) -> ServerProfile {
    if let Some(header) = server_header {
        let header = header.to_lowercase();
        if header.contains("apache") {
            return ServerProfile::for_kind(ServerKind::Apache);
        }
        if header.contains("nginx") {
            return ServerProfile::for_kind(ServerKind::Nginx);
        }
        if header.contains("iis") || header.contains("microsoft") {
            return ServerProfile::for_kind(ServerKind::Iis);
        }
        if header.contains("simplehttp") || header.contains("python") {
            return ServerProfile::for_kind(ServerKind::PythonSimple);
        }
        if header.contains("lighttpd") {
            return ServerProfile::for_kind(ServerKind::Generic);
        }
    }

    let body = body_prefix.to_lowercase();
    if body.contains("directory listing for") {
        return ServerProfile::for_kind(ServerKind::PythonSimple);
    }
    if body.contains("[to parent directory]") {
        return ServerProfile::for_kind(ServerKind::Iis);
    }
    if body.contains("index of") && body.contains("apache") {
        return ServerProfile::for_kind(ServerKind::Apache);
    }
    if body.contains("<h1>index of") || body.contains("autoindex") {
        return ServerProfile::for_kind(ServerKind::Nginx);
    }
    if body.contains("index of") {
        return ServerProfile::for_kind(ServerKind::Generic);
    }

    ServerProfile::for_kind(ServerKind::Unknown)
}

/// Per-authority profile cache; first detection wins.
#[derive(Debug, Default)]
pub struct ProfileCache {
    cache: DashMap<String, ServerProfile>,
}

impl ProfileCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Returns the cached profile for the authority, detecting it from the
    /// given response on first sight. Later responses never widen or
    /// replace a cached profile.
    pub fn profile_for(
        &self,
        authority: &str,
        server_header: Option<&str>,
        body_prefix: &str,
    ) -> ServerProfile {
        if let Some(existing) = self.cache.get(authority) {
            return existing.clone();
        }
        let profile = detect(server_header, body_prefix);
        debug!(authority, kind = ?profile.kind, "detected server profile");
        self.cache.insert(authority.to_string(), profile.clone());
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_apache_from_header() {
        let p = detect(Some("Apache/2.4.57 (Debian)"), "");
        assert_eq!(p.kind, ServerKind::Apache);
        assert_eq!(p.strategies[0], StrategyKind::Table);
    }

    #[test]
    fn test_detect_nginx_from_header() {
        let p = detect(Some("nginx/1.24.0"), "");
        assert_eq!(p.kind, ServerKind::Nginx);
        assert_eq!(p.strategies[0], StrategyKind::Anchors);
    }

    #[test]
    fn test_detect_iis_from_header() {
        assert_eq!(detect(Some("Microsoft-IIS/10.0"), "").kind, ServerKind::Iis);
    }

    #[test]
    fn test_detect_python_from_header() {
        let p = detect(Some("SimpleHTTP/0.6 Python/3.11.2"), "");
        assert_eq!(p.kind, ServerKind::PythonSimple);
    }

    #[test]
    fn test_header_wins_over_body() {
        let p = detect(Some("nginx/1.24.0"), "<h1>Directory listing for /</h1>");
        assert_eq!(p.kind, ServerKind::Nginx);
    }

    #[test]
    fn test_detect_python_from_body() {
        let p = detect(None, "<html><h1>Directory listing for /files/</h1></html>");
        assert_eq!(p.kind, ServerKind::PythonSimple);
    }

    #[test]
    fn test_detect_nginx_from_body() {
        let p = detect(None, "<html><head></head><body><h1>Index of /files/</h1>");
        assert_eq!(p.kind, ServerKind::Nginx);
    }

    #[test]
    fn test_detect_iis_from_body() {
        let p = detect(None, "<title>[To Parent Directory]</title>");
        assert_eq!(p.kind, ServerKind::Iis);
    }

    #[test]
    fn test_detect_unknown_falls_back_to_full_sequence() {
        let p = detect(None, "{\"error\": \"not found\"}");
        assert_eq!(p.kind, ServerKind::Unknown);
        assert_eq!(p.strategies.len(), 3);
    }

    #[test]
    fn test_cache_first_detection_wins() {
        let cache = ProfileCache::new();
        let first = cache.profile_for("example.com", Some("Apache/2.4"), "");
        assert_eq!(first.kind, ServerKind::Apache);
        // A contradictory later response must not change the cached profile.
        let second = cache.profile_for("example.com", Some("nginx/1.24.0"), "");
        assert_eq!(second.kind, ServerKind::Apache);
    }

    #[test]
    fn test_cache_is_per_authority() {
        let cache = ProfileCache::new();
        cache.profile_for("a.example.com", Some("Apache/2.4"), "");
        let other = cache.profile_for("b.example.com:8080", Some("nginx/1.24.0"), "");
        assert_eq!(other.kind, ServerKind::Nginx);
    }
}
