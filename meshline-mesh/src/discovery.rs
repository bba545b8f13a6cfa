//! Service discovery cache with TTL, single-flight refresh and last-known-good fallback.
//!
//! # Examples
//!
//! ```no_run
//! use meshline_mesh::config::{DiscoveryConfig, RegistryConfig};
//! use meshline_mesh::discovery::DiscoveryCache;
//! use meshline_mesh::registry::{InMemoryRegistry, RegistryClient};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let client = Arc::new(RegistryClient::new(
//!     Arc::new(InMemoryRegistry::new()),
//!     &RegistryConfig::default(),
//! ));
//! let cache = DiscoveryCache::new(client, &DiscoveryConfig::default());
//! let instances = cache.resolve("billing").await;
//! # }
//! ```

use dashmap::DashMap;
use meshline_core::{HealthStatus, ServiceInstance};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::registry::{RegistryClient, RegistryEvent};

/// A resolved instance list with metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
    instances: Vec<ServiceInstance>,
    fetched_at: Instant,
    invalidated: bool,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        !self.invalidated && self.fetched_at.elapsed() < ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    /// Resolves answered from a stale entry (or empty) because the registry failed.
    pub fallbacks: u64,
    pub current_entries: usize,
    /// Cache hit rate (0.0 - 1.0).
    pub hit_rate: f64,
}

/// Per-service cache of healthy instances in front of the [`RegistryClient`].
pub struct DiscoveryCache {
    client: Arc<RegistryClient>,
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    stats_hits: AtomicU64,
    stats_misses: AtomicU64,
    stats_fallbacks: AtomicU64,
}

impl DiscoveryCache {
    pub fn new(client: Arc<RegistryClient>, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            ttl: config.ttl,
            entries: DashMap::new(),
            inflight: DashMap::new(),
            stats_hits: AtomicU64::new(0),
            stats_misses: AtomicU64::new(0),
            stats_fallbacks: AtomicU64::new(0),
        }
    }

    /// Routable instances of `service`, sorted by instance id.
    ///
    /// Fresh entries are served without registry I/O. Concurrent misses for one service share a
    /// single registry call. When the registry fails, the last good list is served even if stale;
    /// without one the result is empty.
    pub async fn resolve(&self, service: &str) -> Vec<ServiceInstance> {
        if let Some(instances) = self.fresh(service) {
            self.record_hit(service);
            return instances;
        }

        let lock = self
            .inflight
            .entry(service.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have refreshed the entry while we waited.
        if let Some(instances) = self.fresh(service) {
            self.record_hit(service);
            return instances;
        }

        self.stats_misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("meshline_discovery_misses_total", "service" => service.to_string())
            .increment(1);

        match self.client.discover(service).await {
            Ok(instances) => {
                let mut routable: Vec<ServiceInstance> = instances
                    .into_iter()
                    .filter(|instance| instance.health_status != HealthStatus::Critical)
                    .collect();
                routable.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

                debug!(service, instances = routable.len(), "Discovery cache refreshed");
                self.entries.insert(
                    service.to_string(),
                    CacheEntry {
                        instances: routable.clone(),
                        fetched_at: Instant::now(),
                        invalidated: false,
                    },
                );
                routable
            }
            Err(error) => {
                self.stats_fallbacks.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("meshline_discovery_fallbacks_total", "service" => service.to_string())
                    .increment(1);

                let stale = self.entries.get(service).map(|entry| entry.instances.clone());
                warn!(
                    service,
                    %error,
                    fallback_instances = stale.as_ref().map_or(0, Vec::len),
                    "Discovery failed, serving last known instances"
                );
                stale.unwrap_or_default()
            }
        }
    }

    /// Forces the next resolve of `service` to contact the registry. The current list is kept as
    /// fallback.
    pub fn invalidate(&self, service: &str) {
        if let Some(mut entry) = self.entries.get_mut(service) {
            entry.invalidated = true;
            debug!(service, "Discovery entry invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        for mut entry in self.entries.iter_mut() {
            entry.invalidated = true;
        }
    }

    /// Invalidates entries as membership events arrive, until the channel closes.
    pub fn spawn_invalidation(
        self: Arc<Self>,
        mut events: broadcast::Receiver<RegistryEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match event.service() {
                        Some(service) => self.invalidate(service),
                        None => self.invalidate_all(),
                    },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed registry events, invalidating all entries");
                        self.invalidate_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("Discovery invalidation listener stopped");
        })
    }

    pub fn statistics(&self) -> CacheStatistics {
        let hits = self.stats_hits.load(Ordering::Relaxed);
        let misses = self.stats_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStatistics {
            hits,
            misses,
            fallbacks: self.stats_fallbacks.load(Ordering::Relaxed),
            current_entries: self.entries.len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn fresh(&self, service: &str) -> Option<Vec<ServiceInstance>> {
        self.entries
            .get(service)
            .filter(|entry| entry.is_fresh(self.ttl))
            .map(|entry| entry.instances.clone())
    }

    fn record_hit(&self, service: &str) {
        self.stats_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("meshline_discovery_hits_total", "service" => service.to_string())
            .increment(1);
    }
}

impl std::fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::registry::{Fault, InMemoryRegistry};
    use crate::resilience::RetryConfig;

    fn setup(ttl: Duration) -> (Arc<InMemoryRegistry>, DiscoveryCache) {
        let backend = Arc::new(InMemoryRegistry::new());
        let registry_config = RegistryConfig {
            retry: RetryConfig {
                max_attempts: 2,
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let client = Arc::new(RegistryClient::new(backend.clone(), &registry_config));
        (backend, DiscoveryCache::new(client, &DiscoveryConfig { ttl }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_instances_filtered_and_sorted() {
        let (backend, cache) = setup(Duration::from_secs(30));
        backend.insert_instance(ServiceInstance::new("billing", "b-2", "10.0.0.2", 80));
        backend.insert_instance(ServiceInstance::new("billing", "b-1", "10.0.0.1", 80));
        backend.insert_instance(
            ServiceInstance::new("billing", "b-3", "10.0.0.3", 80).with_health(HealthStatus::Critical),
        );

        let ids: Vec<_> = cache
            .resolve("billing")
            .await
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(ids, vec!["b-1", "b-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refreshed() {
        let (backend, cache) = setup(Duration::from_secs(30));
        backend.insert_instance(ServiceInstance::new("billing", "b-1", "10.0.0.1", 80));

        cache.resolve("billing").await;
        tokio::time::advance(Duration::from_secs(31)).await;
        cache.resolve("billing").await;

        assert_eq!(backend.calls("discover"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refresh() {
        let (backend, cache) = setup(Duration::from_secs(30));
        backend.insert_instance(ServiceInstance::new("billing", "b-1", "10.0.0.1", 80));

        cache.resolve("billing").await;
        cache.invalidate("billing");
        cache.resolve("billing").await;

        assert_eq!(backend.calls("discover"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_failure_serves_stale_entry() {
        let (backend, cache) = setup(Duration::from_secs(30));
        backend.insert_instance(ServiceInstance::new("billing", "b-1", "10.0.0.1", 80));
        assert_eq!(cache.resolve("billing").await.len(), 1);

        cache.invalidate("billing");
        backend.script("discover", Fault::Unavailable, 2);
        assert_eq!(cache.resolve("billing").await.len(), 1);
        assert_eq!(cache.statistics().fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_failure_without_entry_is_empty() {
        let (backend, cache) = setup(Duration::from_secs(30));
        backend.script("discover", Fault::Unavailable, 2);
        assert!(cache.resolve("billing").await.is_empty());
    }
}
