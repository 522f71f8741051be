//! Wildcard host routes
//!
//! A route host may be a single-level wildcard at the leftmost label, such
//! as `*.apps.internal`. It matches exactly one extra label in front of the
//! base domain: `web.apps.internal` matches, `apps.internal` and
//! `a.web.apps.internal` do not.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WildcardError {
    #[error("Empty host label in {0:?}")]
    EmptyLabel(String),

    #[error("Wildcard must be the whole leftmost label: {0:?}")]
    MisplacedWildcard(String),

    #[error("Wildcard needs a base domain with at least two labels: {0:?}")]
    BaseTooShort(String),
}

/// A validated `*.<base>` host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WildcardPattern {
    base_domain: String,
}

impl WildcardPattern {
    /// Parse `*.<base>`. Returns `Ok(None)` for hosts that carry no `*`.
    pub fn parse(host: &str) -> Result<Option<Self>, WildcardError> {
        if !host.contains('*') {
            return Ok(None);
        }

        let base = match host.strip_prefix("*.") {
            Some(base) => base,
            None => return Err(WildcardError::MisplacedWildcard(host.to_string())),
        };

        if base.contains('*') {
            return Err(WildcardError::MisplacedWildcard(host.to_string()));
        }
        if base.split('.').any(str::is_empty) {
            return Err(WildcardError::EmptyLabel(host.to_string()));
        }
        if !base.contains('.') {
            return Err(WildcardError::BaseTooShort(host.to_string()));
        }

        Ok(Some(Self {
            base_domain: base.to_string(),
        }))
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    pub fn matches(&self, hostname: &str) -> bool {
        match hostname
            .strip_suffix(self.base_domain.as_str())
            .and_then(|prefix| prefix.strip_suffix('.'))
        {
            Some(label) => !label.is_empty() && !label.contains('.'),
            None => false,
        }
    }
}

impl std::fmt::Display for WildcardPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "*.{}", self.base_domain)
    }
}

/// The wildcard host that would cover `hostname`, if any.
///
/// `web.apps.internal` -> `*.apps.internal`; `internal` and `apps.internal`
/// have no usable parent.
pub fn extract_parent_wildcard(hostname: &str) -> Option<String> {
    let (_, parent) = hostname.split_once('.')?;
    if parent.contains('.') {
        Some(format!("*.{}", parent))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_host() {
        assert_eq!(WildcardPattern::parse("api.example.com"), Ok(None));
    }

    #[test]
    fn test_parse_valid_wildcard() {
        let pattern = WildcardPattern::parse("*.apps.internal").unwrap().unwrap();
        assert_eq!(pattern.base_domain(), "apps.internal");
        assert_eq!(pattern.to_string(), "*.apps.internal");
    }

    #[test]
    fn test_parse_rejects_bad_wildcards() {
        assert!(matches!(
            WildcardPattern::parse("api.*.example.com"),
            Err(WildcardError::MisplacedWildcard(_))
        ));
        assert!(matches!(
            WildcardPattern::parse("**.example.com"),
            Err(WildcardError::MisplacedWildcard(_))
        ));
        assert!(matches!(
            WildcardPattern::parse("*"),
            Err(WildcardError::MisplacedWildcard(_))
        ));
        assert!(matches!(
            WildcardPattern::parse("*.com"),
            Err(WildcardError::BaseTooShort(_))
        ));
        assert!(matches!(
            WildcardPattern::parse("*.example..com"),
            Err(WildcardError::EmptyLabel(_))
        ));
    }

    #[test]
    fn test_matches_single_level_only() {
        let pattern = WildcardPattern::parse("*.apps.internal").unwrap().unwrap();
        assert!(pattern.matches("web.apps.internal"));
        assert!(!pattern.matches("apps.internal"));
        assert!(!pattern.matches("a.web.apps.internal"));
        assert!(!pattern.matches("webapps.internal"));
    }

    #[test]
    fn test_extract_parent_wildcard() {
        assert_eq!(
            extract_parent_wildcard("web.apps.internal"),
            Some("*.apps.internal".to_string())
        );
        assert_eq!(extract_parent_wildcard("apps.internal"), None);
        assert_eq!(extract_parent_wildcard("localhost"), None);
    }
}
