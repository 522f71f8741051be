//! Route registry
//!
//! Owns the route trie behind a single reader/writer lock and runs the
//! periodic staleness pruning task.

use crate::endpoint::Endpoint;
use crate::pool::{EndpointView, PoolPut, RoutePool};
use crate::route_key::RouteKey;
use crate::trie::Trie;
use crate::wildcard::WildcardPattern;
use crate::RouterError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Connectivity predicate; returning `true` suspends pruning
pub type SuspendPruning = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub prune_stale_droplets_interval: Duration,
    pub droplet_stale_threshold: Duration,
    /// Failure window for endpoints in newly created pools
    pub retry_after_failure: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prune_stale_droplets_interval: Duration::from_secs(30),
            droplet_stale_threshold: Duration::from_secs(120),
            retry_after_failure: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PruneStatus {
    Connected,
    Disconnected,
}

/// What a single pruning pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Suspension predicate was active, nothing touched
    Suspended,
    /// First pass after a suspension: every endpoint was freshened
    Resumed,
    Pruned { endpoints: usize, routes: usize },
}

pub struct RouteRegistry {
    config: RegistryConfig,
    trie: RwLock<Trie>,
    suspend_pruning: RwLock<SuspendPruning>,
    prune_status: Mutex<PruneStatus>,
    time_of_last_update: Mutex<Option<Instant>>,
    pruning_cycle: Mutex<Option<CancellationToken>>,
}

impl RouteRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            trie: RwLock::new(Trie::new()),
            suspend_pruning: RwLock::new(Arc::new(|| false)),
            prune_status: Mutex::new(PruneStatus::Connected),
            time_of_last_update: Mutex::new(None),
            pruning_cycle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn read_trie(&self) -> RwLockReadGuard<'_, Trie> {
        self.trie.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_trie(&self) -> RwLockWriteGuard<'_, Trie> {
        self.trie.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        if let Ok(mut last) = self.time_of_last_update.lock() {
            *last = Some(Instant::now());
        }
    }

    /// Install the predicate polled at the start of every pruning pass
    pub fn suspend_pruning<F>(&self, predicate: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.suspend_pruning.write() {
            *slot = Arc::new(predicate);
        }
    }

    pub fn register(&self, uri: &str, endpoint: Endpoint) -> Result<PoolPut, RouterError> {
        let key = RouteKey::parse(uri)?;
        WildcardPattern::parse(key.host())?;

        let address = endpoint.canonical_addr();
        let outcome = {
            let mut trie = self.write_trie();
            let pool = trie.insert_or_get(&key, || {
                RoutePool::new(self.config.retry_after_failure, key.context_path())
            });
            pool.put(endpoint)
        };

        match outcome {
            PoolPut::Added | PoolPut::Updated => {
                debug!(route = %key, address = %address, ?outcome, "Registered endpoint");
            }
            PoolPut::Refreshed => trace!(route = %key, address = %address, "Refreshed endpoint"),
            PoolPut::Ignored => {
                debug!(route = %key, address = %address, "Ignored out-of-order registration");
            }
        }
        if outcome != PoolPut::Ignored {
            self.touch();
        }

        Ok(outcome)
    }

    /// Remove an endpoint from the route's pool. The route itself stays
    /// until a pruning pass finds it empty.
    pub fn unregister(&self, uri: &str, endpoint: &Endpoint) -> Result<bool, RouterError> {
        let key = RouteKey::parse(uri)?;

        let removed = {
            let trie = self.write_trie();
            match trie.get(&key) {
                Some(pool) => pool.remove(endpoint),
                None => false,
            }
        };

        if removed {
            debug!(route = %key, address = %endpoint.canonical_addr(), "Unregistered endpoint");
            self.touch();
        }
        Ok(removed)
    }

    /// Pool of the longest route matching `uri`
    pub fn lookup(&self, uri: &str) -> Option<Arc<RoutePool>> {
        let key = RouteKey::parse(uri).ok()?;
        let pool = self.read_trie().find(&key);
        if pool.is_none() {
            trace!(route = %key, "No route found");
        }
        pool
    }

    /// Like [`lookup`](Self::lookup), restricted to one application instance.
    /// The returned pool may be empty.
    pub fn lookup_with_instance(
        &self,
        uri: &str,
        app_id: &str,
        app_index: &str,
    ) -> Option<Arc<RoutePool>> {
        let pool = self.lookup(uri)?;
        Some(Arc::new(pool.filtered(|endpoint| {
            endpoint.application_id == app_id && endpoint.private_instance_index == app_index
        })))
    }

    pub fn num_uris(&self) -> usize {
        self.read_trie().route_count()
    }

    pub fn num_endpoints(&self) -> usize {
        let mut count = 0;
        self.read_trie().walk(|_, pool| count += pool.len());
        count
    }

    pub fn time_of_last_update(&self) -> Option<Instant> {
        self.time_of_last_update.lock().ok().and_then(|last| *last)
    }

    /// Route key -> endpoints, copied under the read lock
    pub fn snapshot(&self) -> BTreeMap<String, Vec<EndpointView>> {
        let mut pools = Vec::new();
        self.read_trie()
            .walk(|key, pool| pools.push((key.to_string(), pool.clone())));

        pools
            .into_iter()
            .map(|(key, pool)| (key, pool.views(self.config.droplet_stale_threshold)))
            .collect()
    }

    pub fn marshal_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.snapshot())
    }

    /// Run one pruning pass
    pub fn prune_stale_droplets(&self) -> PruneOutcome {
        let predicate = match self.suspend_pruning.read() {
            Ok(predicate) => predicate.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        // Polled without holding the trie lock
        let suspended = predicate();

        {
            let mut status = self
                .prune_status
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if suspended {
                if *status == PruneStatus::Connected {
                    warn!("prune-suspended");
                    *status = PruneStatus::Disconnected;
                }
                return PruneOutcome::Suspended;
            }

            if *status == PruneStatus::Disconnected {
                *status = PruneStatus::Connected;
                drop(status);
                self.freshen_routes();
                info!("prune-resumed");
                return PruneOutcome::Resumed;
            }
        }

        let now = Instant::now();
        let threshold = self.config.droplet_stale_threshold;
        let mut endpoints = 0;
        let routes = self.write_trie().prune(|key, pool| {
            for endpoint in pool.prune(now, threshold) {
                info!(route = %key, address = %endpoint.canonical_addr(), "pruned-stale-endpoint");
                endpoints += 1;
            }
        });

        if endpoints > 0 || routes > 0 {
            debug!(endpoints, routes, "Pruning pass complete");
            self.touch();
        }
        PruneOutcome::Pruned { endpoints, routes }
    }

    fn freshen_routes(&self) {
        let now = Instant::now();
        let trie = self.write_trie();
        trie.walk(|_, pool| pool.mark_updated(now));
    }

    /// Spawn the background pruning task. Calling it again while a cycle is
    /// running has no effect.
    pub fn start_pruning_cycle(self: &Arc<Self>) {
        let Ok(mut slot) = self.pruning_cycle.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let period = self.config.prune_stale_droplets_interval;
        let registry = Arc::downgrade(self);
        info!(interval = ?period, "Starting pruning cycle");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        registry.prune_stale_droplets();
                    }
                }
            }
            debug!("Pruning cycle stopped");
        });
    }

    pub fn stop_pruning_cycle(&self) {
        if let Ok(mut slot) = self.pruning_cycle.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }
}

impl Drop for RouteRegistry {
    fn drop(&mut self) {
        self.stop_pruning_cycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ModificationTag;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> RouteRegistry {
        RouteRegistry::new(RegistryConfig::default())
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("10.0.0.1", port)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry();
        registry.register("foo.example.com", endpoint(80)).unwrap();

        let pool = registry.lookup("FOO.example.com:443/anything").unwrap();
        assert_eq!(pool.len(), 1);
        assert!(registry.lookup("bar.example.com").is_none());
        assert_eq!(registry.num_uris(), 1);
        assert_eq!(registry.num_endpoints(), 1);
        assert!(registry.time_of_last_update().is_some());
    }

    #[test]
    fn test_invalid_keys() {
        let registry = registry();
        assert!(matches!(
            registry.register("/no-host", endpoint(80)),
            Err(RouterError::InvalidRouteKey(_))
        ));
        assert!(matches!(
            registry.register("api.*.example.com", endpoint(80)),
            Err(RouterError::InvalidWildcardPattern(_))
        ));
        assert!(registry.lookup("").is_none());
    }

    #[test]
    fn test_context_path_from_route() {
        let registry = registry();
        registry.register("foo.example.com/api/v1/", endpoint(80)).unwrap();
        let pool = registry.lookup("foo.example.com/api/v1/users").unwrap();
        assert_eq!(pool.context_path(), "/api/v1");
    }

    #[test]
    fn test_unregister_keeps_route() {
        let registry = registry();
        registry.register("foo.example.com", endpoint(80)).unwrap();
        assert!(registry.unregister("foo.example.com", &endpoint(80)).unwrap());
        assert!(!registry.unregister("foo.example.com", &endpoint(80)).unwrap());

        let pool = registry.lookup("foo.example.com").unwrap();
        assert!(pool.is_empty());
        assert_eq!(registry.num_uris(), 1);
        assert_eq!(registry.num_endpoints(), 0);
    }

    #[test]
    fn test_unregister_unknown_route() {
        let registry = registry();
        assert!(!registry.unregister("nothing.here", &endpoint(80)).unwrap());
    }

    #[test]
    fn test_out_of_order_registration_suppressed() {
        let registry = registry();
        let tagged = |index, app: &str| {
            endpoint(80)
                .with_application_id(app)
                .with_modification_tag(ModificationTag::new("guid", index))
        };

        assert_eq!(registry.register("a.com", tagged(3, "v3")).unwrap(), PoolPut::Added);
        assert_eq!(registry.register("a.com", tagged(2, "v2")).unwrap(), PoolPut::Ignored);
        assert!(!registry.unregister("a.com", &tagged(1, "v1")).unwrap());

        let pool = registry.lookup("a.com").unwrap();
        assert_eq!(pool.endpoints()[0].application_id, "v3");
    }

    #[test]
    fn test_lookup_with_instance() {
        let registry = registry();
        registry
            .register("a.com", endpoint(80).with_application_id("app").with_instance("x", "0"))
            .unwrap();
        registry
            .register("a.com", endpoint(81).with_application_id("app").with_instance("y", "1"))
            .unwrap();

        let pool = registry.lookup_with_instance("a.com", "app", "1").unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.endpoints()[0].port, 81);

        let empty = registry.lookup_with_instance("a.com", "app", "7").unwrap();
        assert!(empty.is_empty());

        assert!(registry.lookup_with_instance("b.com", "app", "0").is_none());
    }

    #[test]
    fn test_marshal_json() {
        let registry = registry();
        registry.register("a.com/api", endpoint(80)).unwrap();
        registry.register("a.com", endpoint(81)).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&registry.marshal_json().unwrap()).unwrap();
        assert_eq!(json["a.com/api"][0]["address"], "10.0.0.1:80");
        assert_eq!(json["a.com"][0]["address"], "10.0.0.1:81");
    }

    #[tokio::test(start_paused = true)]
    async fn test_marshal_json_reports_remaining_ttl() {
        let registry = registry();
        registry.register("a.com", endpoint(80)).unwrap();
        registry
            .register("a.com", endpoint(81).with_stale_threshold_secs(30))
            .unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;

        let json: serde_json::Value =
            serde_json::from_str(&registry.marshal_json().unwrap()).unwrap();
        let ttls: HashMap<String, u64> = json["a.com"]
            .as_array()
            .unwrap()
            .iter()
            .map(|view| {
                (
                    view["address"].as_str().unwrap().to_string(),
                    view["ttl"].as_u64().unwrap(),
                )
            })
            .collect();
        assert_eq!(ttls["10.0.0.1:80"], 100);
        assert_eq!(ttls["10.0.0.1:81"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_removes_stale_endpoints() {
        let registry = registry();
        registry.register("a.com", endpoint(80)).unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        registry.register("b.com", endpoint(81)).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            registry.prune_stale_droplets(),
            PruneOutcome::Pruned {
                endpoints: 1,
                routes: 1
            }
        );
        assert!(registry.lookup("a.com").is_none());
        assert!(registry.lookup("b.com").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_pruning_then_resume() {
        let registry = registry();
        let disconnected = Arc::new(AtomicBool::new(true));
        let flag = disconnected.clone();
        registry.suspend_pruning(move || flag.load(Ordering::SeqCst));

        registry.register("a.com", endpoint(80)).unwrap();
        tokio::time::advance(Duration::from_secs(300)).await;

        assert_eq!(registry.prune_stale_droplets(), PruneOutcome::Suspended);
        assert_eq!(registry.num_endpoints(), 1);

        disconnected.store(false, Ordering::SeqCst);
        assert_eq!(registry.prune_stale_droplets(), PruneOutcome::Resumed);
        assert_eq!(registry.num_endpoints(), 1);

        assert_eq!(
            registry.prune_stale_droplets(),
            PruneOutcome::Pruned {
                endpoints: 0,
                routes: 0
            }
        );
        assert_eq!(registry.num_endpoints(), 1);
    }
}
