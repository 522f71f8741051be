//! Backend endpoint description and registration versioning

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Versioning token carried by every registration event.
///
/// Registration messages can arrive out of order, so the pool compares the
/// stored tag against the incoming one before applying an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModificationTag {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub index: u32,
}

/// How an incoming tag relates to the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOrdering {
    /// Replace the stored endpoint and refresh it
    Newer,
    /// Refresh the timestamp only
    Equal,
    /// Out-of-order update, ignore entirely
    Older,
}

impl ModificationTag {
    pub fn new(guid: impl Into<String>, index: u32) -> Self {
        Self {
            guid: guid.into(),
            index,
        }
    }

    /// Compare an incoming tag against `self` (the stored tag).
    ///
    /// An empty guid on either side means the registration is unversioned and
    /// always wins. A different guid starts a new lineage.
    pub fn compare_incoming(&self, incoming: &ModificationTag) -> TagOrdering {
        if self.guid.is_empty() || incoming.guid.is_empty() || self.guid != incoming.guid {
            return TagOrdering::Newer;
        }

        match incoming.index.cmp(&self.index) {
            std::cmp::Ordering::Greater => TagOrdering::Newer,
            std::cmp::Ordering::Equal => TagOrdering::Equal,
            std::cmp::Ordering::Less => TagOrdering::Older,
        }
    }

    pub fn succeeded_by(&self, incoming: &ModificationTag) -> bool {
        self.compare_incoming(incoming) == TagOrdering::Newer
    }
}

/// One backend instance reachable at a network address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub application_id: String,
    pub host: String,
    pub port: u16,
    pub private_instance_id: String,
    pub private_instance_index: String,
    /// Diagnostic annotations (runtime, framework, ...)
    pub tags: HashMap<String, String>,
    /// Zero means "use the registry default"
    pub stale_threshold: Duration,
    pub route_service_url: Option<String>,
    pub modification_tag: ModificationTag,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Endpoint with no identity, handed to observers when no pool member
    /// was involved (route services, selection failures)
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn is_placeholder(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }

    pub fn with_application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = application_id.into();
        self
    }

    pub fn with_instance(mut self, id: impl Into<String>, index: impl Into<String>) -> Self {
        self.private_instance_id = id.into();
        self.private_instance_index = index.into();
        self
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the staleness threshold from a TTL in seconds; non-positive values
    /// fall back to the registry default
    pub fn with_stale_threshold_secs(mut self, secs: i64) -> Self {
        self.stale_threshold = if secs > 0 {
            Duration::from_secs(secs as u64)
        } else {
            Duration::ZERO
        };
        self
    }

    pub fn with_route_service_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.route_service_url = if url.is_empty() { None } else { Some(url) };
        self
    }

    pub fn with_modification_tag(mut self, tag: ModificationTag) -> Self {
        self.modification_tag = tag;
        self
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn canonical_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the outbound instance identity header
    pub fn instance_id_header_value(&self) -> String {
        if self.private_instance_id.is_empty() {
            self.canonical_addr()
        } else {
            self.private_instance_id.clone()
        }
    }

    /// Effective staleness threshold given the registry default
    pub fn effective_stale_threshold(&self, default_threshold: Duration) -> Duration {
        if !self.stale_threshold.is_zero() && self.stale_threshold < default_threshold {
            self.stale_threshold
        } else {
            default_threshold
        }
    }
}
