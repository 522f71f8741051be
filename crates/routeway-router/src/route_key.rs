//! Route key normalization
//!
//! Registration and lookup both go through [`RouteKey::parse`] so that
//! `HTTP://Shop.Example.com:8080/cart/?x=1` and `shop.example.com/cart`
//! land on the same trie node.

use crate::RouterError;
use std::fmt;

/// Normalized `(host, path)` pair used as the trie key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    host: String,
    /// Empty, or `/`-prefixed without a trailing `/`
    path: String,
}

impl RouteKey {
    pub fn parse(uri: &str) -> Result<Self, RouterError> {
        let trimmed = uri.trim();
        let without_scheme = match trimmed.find("://") {
            Some(idx) => &trimmed[idx + 3..],
            None => trimmed,
        };
        let without_query = without_scheme
            .split(['?', '#'])
            .next()
            .unwrap_or_default();

        let (authority, path) = match without_query.find('/') {
            Some(idx) => without_query.split_at(idx),
            None => (without_query, ""),
        };

        let host = strip_port(authority).to_ascii_lowercase();
        if host.is_empty() {
            return Err(RouterError::InvalidRouteKey(uri.to_string()));
        }

        Ok(Self {
            host,
            path: path.trim_end_matches('/').to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Non-empty path segments, in order
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// Host labels from the top-level domain down
    pub fn reversed_labels(&self) -> impl Iterator<Item = &str> {
        self.host.rsplit('.')
    }

    /// Path under which the route is mounted, always `/`-prefixed
    pub fn context_path(&self) -> String {
        if self.path.is_empty() {
            "/".to_string()
        } else {
            self.path.clone()
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        let key = RouteKey::parse("HTTP://Shop.Example.com:8080/cart/?x=1#top").unwrap();
        assert_eq!(key.host(), "shop.example.com");
        assert_eq!(key.path(), "/cart");
        assert_eq!(key.to_string(), "shop.example.com/cart");
    }

    #[test]
    fn test_parse_bare_host() {
        let key = RouteKey::parse("example.com/").unwrap();
        assert_eq!(key.host(), "example.com");
        assert_eq!(key.path(), "");
        assert_eq!(key.context_path(), "/");
    }

    #[test]
    fn test_context_path() {
        let key = RouteKey::parse("example.com/api/v1").unwrap();
        assert_eq!(key.context_path(), "/api/v1");
        assert_eq!(key.segments().collect::<Vec<_>>(), vec!["api", "v1"]);
    }

    #[test]
    fn test_reversed_labels() {
        let key = RouteKey::parse("www.example.com").unwrap();
        assert_eq!(
            key.reversed_labels().collect::<Vec<_>>(),
            vec!["com", "example", "www"]
        );
    }

    #[test]
    fn test_ipv6_host() {
        let key = RouteKey::parse("[::1]:8080/x").unwrap();
        assert_eq!(key.host(), "::1");
        assert_eq!(key.path(), "/x");
    }

    #[test]
    fn test_empty_host_rejected() {
        assert!(RouteKey::parse("").is_err());
        assert!(RouteKey::parse("/only/path").is_err());
        assert!(RouteKey::parse("http://:80/").is_err());
    }
}
