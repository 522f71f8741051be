//! Per-request endpoint selection
//!
//! A [`PoolIterator`] snapshots the pool when it is created and hands out
//! endpoints for one logical request. Endpoints already tried by this
//! request, and endpoints with a recent failure mark, sink to the back of the
//! selection order but are never excluded outright.

use crate::endpoint::Endpoint;
use crate::pool::{Candidate, RoutePool};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::trace;

/// Selection cursor consumed by the round trippers
pub trait EndpointIterator: Send {
    /// Next endpoint to try, `None` when the pool is empty
    fn next(&mut self) -> Option<Arc<Endpoint>>;

    /// Record a failure against the most recently selected endpoint
    fn endpoint_failed(&mut self);

    fn pre_request(&self, endpoint: &Endpoint);

    fn post_request(&self, endpoint: &Endpoint);
}

/// Load-balancing policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalance {
    #[default]
    RoundRobin,
    LeastConnection,
}

impl FromStr for LoadBalance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "least-connection" => Ok(Self::LeastConnection),
            other => Err(format!("unknown load balancing policy: {}", other)),
        }
    }
}

pub struct PoolIterator {
    pool: Arc<RoutePool>,
    candidates: Vec<Candidate>,
    attempts: Vec<u32>,
    sticky_instance: Option<String>,
    last: Option<usize>,
    policy: LoadBalance,
}

impl PoolIterator {
    pub fn new(pool: Arc<RoutePool>) -> Self {
        let candidates = pool.candidates();
        Self {
            attempts: vec![0; candidates.len()],
            pool,
            candidates,
            sticky_instance: None,
            last: None,
            policy: LoadBalance::default(),
        }
    }

    /// Prefer the endpoint with this private instance id on the first pick
    pub fn with_sticky_instance(mut self, instance_id: Option<String>) -> Self {
        self.sticky_instance = instance_id.filter(|id| !id.is_empty());
        self
    }

    pub fn with_policy(mut self, policy: LoadBalance) -> Self {
        self.policy = policy;
        self
    }

    fn position_of(&self, endpoint: &Endpoint) -> Option<usize> {
        let addr = endpoint.canonical_addr();
        self.candidates
            .iter()
            .position(|c| c.endpoint.canonical_addr() == addr)
    }

    fn sticky_pick(&mut self) -> Option<usize> {
        let instance_id = self.sticky_instance.take()?;
        let position = self
            .candidates
            .iter()
            .position(|c| c.endpoint.private_instance_id == instance_id);
        if position.is_none() {
            trace!(instance_id = %instance_id, "Sticky instance no longer in pool");
        }
        position
    }

    fn rotation_pick(&self) -> usize {
        let len = self.candidates.len();
        let now = Instant::now();
        let window = self.pool.retry_after_failure();
        let start = self.pool.rotation_start(len);

        let mut best = start;
        let mut best_rank = (u64::MAX, i64::MAX);
        for offset in 0..len {
            let idx = (start + offset) % len;
            let candidate = &self.candidates[idx];
            let tier = u64::from(self.attempts[idx]) * 2
                + u64::from(candidate.stats.is_failed(now, window));
            let load = match self.policy {
                LoadBalance::RoundRobin => 0,
                LoadBalance::LeastConnection => candidate.stats.in_flight(),
            };
            if (tier, load) < best_rank {
                best = idx;
                best_rank = (tier, load);
            }
        }
        best
    }
}

impl EndpointIterator for PoolIterator {
    fn next(&mut self) -> Option<Arc<Endpoint>> {
        if self.candidates.is_empty() {
            return None;
        }

        let idx = match self.sticky_pick() {
            Some(idx) => idx,
            None => {
                let idx = self.rotation_pick();
                self.pool.advance_rotation(idx);
                idx
            }
        };

        self.attempts[idx] += 1;
        self.last = Some(idx);
        Some(self.candidates[idx].endpoint.clone())
    }

    fn endpoint_failed(&mut self) {
        if let Some(idx) = self.last {
            self.candidates[idx].stats.mark_failed(Instant::now());
        }
    }

    fn pre_request(&self, endpoint: &Endpoint) {
        if let Some(idx) = self.position_of(endpoint) {
            self.candidates[idx].stats.increment();
        }
    }

    fn post_request(&self, endpoint: &Endpoint) {
        if let Some(idx) = self.position_of(endpoint) {
            self.candidates[idx].stats.decrement();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn pool_of(ports: &[u16]) -> Arc<RoutePool> {
        let pool = RoutePool::new(Duration::from_secs(10), "/");
        for port in ports {
            pool.put(Endpoint::new("10.0.0.1", *port).with_instance(format!("id-{}", port), "0"));
        }
        Arc::new(pool)
    }

    #[test]
    fn test_empty_pool_yields_none() {
        let mut iter = PoolIterator::new(pool_of(&[]));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_round_robin_across_requests() {
        let pool = pool_of(&[80, 81, 82]);
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let mut iter = PoolIterator::new(pool.clone());
            seen.insert(iter.next().unwrap().port);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_retry_prefers_untried_endpoints() {
        let pool = pool_of(&[80, 81, 82]);
        let mut iter = PoolIterator::new(pool);
        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(iter.next().unwrap().port);
            iter.endpoint_failed();
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_single_endpoint_is_reused() {
        let mut iter = PoolIterator::new(pool_of(&[80]));
        for _ in 0..3 {
            assert_eq!(iter.next().unwrap().port, 80);
            iter.endpoint_failed();
        }
    }

    #[test]
    fn test_failed_endpoint_deprioritized_across_requests() {
        let pool = pool_of(&[80, 81]);
        let mut first = PoolIterator::new(pool.clone());
        let failed = first.next().unwrap().port;
        first.endpoint_failed();

        for _ in 0..4 {
            let mut iter = PoolIterator::new(pool.clone());
            assert_ne!(iter.next().unwrap().port, failed);
        }
    }

    #[test]
    fn test_sticky_instance_preferred() {
        let pool = pool_of(&[80, 81, 82]);
        for _ in 0..5 {
            let mut iter =
                PoolIterator::new(pool.clone()).with_sticky_instance(Some("id-81".into()));
            assert_eq!(iter.next().unwrap().port, 81);
        }
    }

    #[test]
    fn test_sticky_only_applies_to_first_pick() {
        let pool = pool_of(&[80, 81]);
        let mut iter = PoolIterator::new(pool).with_sticky_instance(Some("id-81".into()));
        assert_eq!(iter.next().unwrap().port, 81);
        iter.endpoint_failed();
        assert_eq!(iter.next().unwrap().port, 80);
    }

    #[test]
    fn test_sticky_falls_back_when_instance_gone() {
        let pool = pool_of(&[80, 81]);
        let mut iter = PoolIterator::new(pool).with_sticky_instance(Some("id-99".into()));
        let port = iter.next().unwrap().port;
        assert!(port == 80 || port == 81);
    }

    #[test]
    fn test_least_connection_picks_idle_endpoint() {
        let pool = pool_of(&[80, 81]);
        let busy = PoolIterator::new(pool.clone());
        let endpoint_80 = pool.endpoints().into_iter().find(|e| e.port == 80).unwrap();
        busy.pre_request(&endpoint_80);
        busy.pre_request(&endpoint_80);

        for _ in 0..3 {
            let mut iter = PoolIterator::new(pool.clone()).with_policy(LoadBalance::LeastConnection);
            assert_eq!(iter.next().unwrap().port, 81);
        }

        busy.post_request(&endpoint_80);
        busy.post_request(&endpoint_80);
    }

    #[test]
    fn test_snapshot_ignores_later_mutation() {
        let pool = pool_of(&[80]);
        let mut iter = PoolIterator::new(pool.clone());
        pool.remove(&Endpoint::new("10.0.0.1", 80));
        assert_eq!(iter.next().unwrap().port, 80);
    }

    #[test]
    fn test_load_balance_from_str() {
        assert_eq!("round-robin".parse::<LoadBalance>(), Ok(LoadBalance::RoundRobin));
        assert_eq!("least-connection".parse::<LoadBalance>(), Ok(LoadBalance::LeastConnection));
        assert!("random".parse::<LoadBalance>().is_err());
    }
}
