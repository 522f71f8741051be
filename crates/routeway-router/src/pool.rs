//! Route pools
//!
//! A [`RoutePool`] holds every endpoint registered under one route key along
//! with the per-endpoint counters shared by concurrent iterators. Endpoints
//! are unique by canonical address.

use crate::endpoint::{Endpoint, TagOrdering};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Result of [`RoutePool::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPut {
    Added,
    Updated,
    /// Same modification tag, only the timestamp moved
    Refreshed,
    /// Older modification tag than the one stored
    Ignored,
}

/// Counters shared by every iterator selecting from the pool
#[derive(Debug, Default)]
pub(crate) struct EndpointStats {
    in_flight: AtomicI64,
    failed_at: Mutex<Option<Instant>>,
}

impl EndpointStats {
    pub(crate) fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn increment(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(if n > 0 { n - 1 } else { 0 })
            });
    }

    pub(crate) fn mark_failed(&self, now: Instant) {
        if let Ok(mut failed_at) = self.failed_at.lock() {
            *failed_at = Some(now);
        }
    }

    /// A failure mark counts only inside the retry window
    pub(crate) fn is_failed(&self, now: Instant, window: Duration) -> bool {
        match self.failed_at.lock() {
            Ok(failed_at) => failed_at.is_some_and(|at| now.saturating_duration_since(at) < window),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    endpoint: Arc<Endpoint>,
    stats: Arc<EndpointStats>,
    updated_at: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    /// canonical address -> position in `entries`
    index: HashMap<String, usize>,
}

impl PoolState {
    fn remove_at(&mut self, position: usize) -> PoolEntry {
        let entry = self.entries.swap_remove(position);
        self.index.remove(&entry.endpoint.canonical_addr());
        if let Some(moved) = self.entries.get(position) {
            self.index.insert(moved.endpoint.canonical_addr(), position);
        }
        entry
    }
}

/// Candidate handed to an iterator at creation
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) endpoint: Arc<Endpoint>,
    pub(crate) stats: Arc<EndpointStats>,
}

/// Serialized form of a pool member, as exposed by the introspection API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointView {
    pub address: String,
    pub ttl: u64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub private_instance_id: String,
}

const UNSEEDED: usize = usize::MAX;

/// Endpoints registered under one route key
#[derive(Debug)]
pub struct RoutePool {
    state: RwLock<PoolState>,
    next_idx: AtomicUsize,
    retry_after_failure: Duration,
    context_path: String,
}

impl RoutePool {
    pub fn new(retry_after_failure: Duration, context_path: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            next_idx: AtomicUsize::new(UNSEEDED),
            retry_after_failure,
            context_path: context_path.into(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn retry_after_failure(&self) -> Duration {
        self.retry_after_failure
    }

    /// Insert or refresh an endpoint, honoring its modification tag
    pub fn put(&self, endpoint: Endpoint) -> PoolPut {
        self.put_at(endpoint, Instant::now())
    }

    pub(crate) fn put_at(&self, endpoint: Endpoint, now: Instant) -> PoolPut {
        let addr = endpoint.canonical_addr();
        let mut state = self.write();

        let existing = state.index.get(&addr).copied();
        if let Some(position) = existing {
            let entry = &mut state.entries[position];
            return match entry
                .endpoint
                .modification_tag
                .compare_incoming(&endpoint.modification_tag)
            {
                TagOrdering::Newer => {
                    entry.endpoint = Arc::new(endpoint);
                    entry.updated_at = now;
                    PoolPut::Updated
                }
                TagOrdering::Equal => {
                    entry.updated_at = now;
                    PoolPut::Refreshed
                }
                TagOrdering::Older => PoolPut::Ignored,
            };
        }

        let position = state.entries.len();
        state.entries.push(PoolEntry {
            endpoint: Arc::new(endpoint),
            stats: Arc::new(EndpointStats::default()),
            updated_at: now,
        });
        state.index.insert(addr, position);
        PoolPut::Added
    }

    /// Remove an endpoint by address. An unregistration carrying an older
    /// modification tag than the stored one is ignored.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut state = self.write();
        let Some(&position) = state.index.get(&endpoint.canonical_addr()) else {
            return false;
        };

        let stored = &state.entries[position].endpoint.modification_tag;
        if stored.compare_incoming(&endpoint.modification_tag) == TagOrdering::Older {
            return false;
        }

        state.remove_at(position);
        true
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.read()
            .entries
            .iter()
            .map(|entry| entry.endpoint.clone())
            .collect()
    }

    pub fn find_by_private_instance_id(&self, id: &str) -> Option<Arc<Endpoint>> {
        if id.is_empty() {
            return None;
        }
        self.read()
            .entries
            .iter()
            .find(|entry| entry.endpoint.private_instance_id == id)
            .map(|entry| entry.endpoint.clone())
    }

    /// First route service configured on any member
    pub fn route_service_url(&self) -> Option<String> {
        self.read()
            .entries
            .iter()
            .find_map(|entry| entry.endpoint.route_service_url.clone())
    }

    /// Remove endpoints not refreshed within their staleness threshold
    pub fn prune(&self, now: Instant, default_threshold: Duration) -> Vec<Arc<Endpoint>> {
        let mut state = self.write();
        let mut removed = Vec::new();
        let mut position = 0;

        while position < state.entries.len() {
            let entry = &state.entries[position];
            let threshold = entry.endpoint.effective_stale_threshold(default_threshold);
            if now.saturating_duration_since(entry.updated_at) > threshold {
                removed.push(state.remove_at(position).endpoint);
            } else {
                position += 1;
            }
        }

        removed
    }

    /// Treat every endpoint as freshly registered
    pub fn mark_updated(&self, now: Instant) {
        for entry in self.write().entries.iter_mut() {
            entry.updated_at = now;
        }
    }

    /// Pool view restricted to matching endpoints. Counters stay shared with
    /// this pool.
    pub fn filtered<F>(&self, predicate: F) -> RoutePool
    where
        F: Fn(&Endpoint) -> bool,
    {
        let mut state = PoolState::default();
        for entry in self.read().entries.iter() {
            if predicate(&entry.endpoint) {
                state
                    .index
                    .insert(entry.endpoint.canonical_addr(), state.entries.len());
                state.entries.push(entry.clone());
            }
        }

        RoutePool {
            state: RwLock::new(state),
            next_idx: AtomicUsize::new(UNSEEDED),
            retry_after_failure: self.retry_after_failure,
            context_path: self.context_path.clone(),
        }
    }

    /// Serializable members; `ttl` counts down the threshold pruning applies
    pub fn views(&self, default_threshold: Duration) -> Vec<EndpointView> {
        let now = Instant::now();
        self.read()
            .entries
            .iter()
            .map(|entry| {
                let endpoint = &entry.endpoint;
                EndpointView {
                    address: endpoint.canonical_addr(),
                    ttl: endpoint
                        .effective_stale_threshold(default_threshold)
                        .saturating_sub(now.saturating_duration_since(entry.updated_at))
                        .as_secs(),
                    tags: endpoint.tags.clone(),
                    route_service_url: endpoint.route_service_url.clone(),
                    private_instance_id: endpoint.private_instance_id.clone(),
                }
            })
            .collect()
    }

    pub(crate) fn candidates(&self) -> Vec<Candidate> {
        self.read()
            .entries
            .iter()
            .map(|entry| Candidate {
                endpoint: entry.endpoint.clone(),
                stats: entry.stats.clone(),
            })
            .collect()
    }

    /// Where the next round-robin scan starts, seeded randomly
    pub(crate) fn rotation_start(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        match self.next_idx.load(Ordering::Relaxed) {
            UNSEEDED => {
                let start = rand::random::<usize>() % len;
                self.next_idx.store(start, Ordering::Relaxed);
                start
            }
            idx => idx % len,
        }
    }

    pub(crate) fn advance_rotation(&self, selected: usize) {
        self.next_idx.store(selected + 1, Ordering::Relaxed);
    }
}
