//! Composition root of the mesh side: registry client, discovery cache, health monitor and
//! partition manager, with the lifecycle of their background tasks.

use meshline_core::{MeshHealthSnapshot, PartitionRecord, ServiceDescriptor, ServiceInstance};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{DependencyConfig, MeshConfig};
use crate::discovery::{CacheStatistics, DiscoveryCache};
use crate::error::{MeshError, MeshResult};
use crate::health::HealthMonitor;
use crate::partition::PartitionManager;
use crate::registry::{Registry, RegistryClient};

#[derive(Default)]
struct Lifecycle {
    self_instance: Option<String>,
    shutdown: Option<watch::Sender<bool>>,
    monitor_task: Option<JoinHandle<()>>,
    invalidation_task: Option<JoinHandle<()>>,
}

/// Service mesh integration for one process.
pub struct MeshIntegrator {
    config: MeshConfig,
    client: Arc<RegistryClient>,
    discovery: Arc<DiscoveryCache>,
    partitions: Arc<PartitionManager>,
    monitor: Arc<HealthMonitor>,
    lifecycle: Mutex<Lifecycle>,
}

impl MeshIntegrator {
    pub fn new(backend: Arc<dyn Registry>, config: MeshConfig) -> MeshResult<Self> {
        config.validate()?;

        let client = Arc::new(RegistryClient::new(backend, &config.registry));
        let discovery = Arc::new(DiscoveryCache::new(Arc::clone(&client), &config.discovery));
        let partitions = Arc::new(PartitionManager::new(
            Arc::clone(&client),
            config.partitions.clone(),
        )?);
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&client),
            Arc::clone(&partitions),
            &config.monitor,
        ));

        Ok(Self {
            config,
            client,
            discovery,
            partitions,
            monitor,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Registers this process and starts the health monitor and cache invalidation tasks.
    ///
    /// The lifecycle is reserved before registering, so of two concurrent calls only one
    /// proceeds. A `shutdown` that lands while registration is in flight wins: the instance
    /// is deregistered again and no task is spawned.
    pub async fn start(&self, descriptor: ServiceDescriptor) -> MeshResult<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut lifecycle = self.lock();
            if lifecycle.shutdown.is_some() {
                return Err(MeshError::Config("mesh integrator already started".to_string()));
            }
            lifecycle.shutdown = Some(shutdown_tx);
        }

        // Subscribe first so our own registration invalidates any cached entry.
        let events = self.client.subscribe();
        if let Err(error) = self.client.register(&descriptor).await {
            if !*shutdown_rx.borrow() {
                self.lock().shutdown = None;
            }
            return Err(error);
        }

        let cancelled = {
            let mut lifecycle = self.lock();
            let cancelled = *shutdown_rx.borrow();
            if !cancelled {
                lifecycle.self_instance = Some(descriptor.instance_id.clone());
                lifecycle.monitor_task = Some(Arc::clone(&self.monitor).spawn(shutdown_rx));
                lifecycle.invalidation_task =
                    Some(Arc::clone(&self.discovery).spawn_invalidation(events));
            }
            cancelled
        };
        if cancelled {
            self.client.deregister(&descriptor.instance_id).await?;
            return Err(MeshError::Config(
                "mesh integrator shut down while starting".to_string(),
            ));
        }

        info!(
            service = %descriptor.service_name,
            instance_id = %descriptor.instance_id,
            backend = self.client.backend_name(),
            "Mesh integrator started"
        );
        Ok(())
    }

    /// Stops background tasks and deregisters this process. Safe to call more than once.
    pub async fn shutdown(&self) -> MeshResult<()> {
        let Lifecycle {
            self_instance,
            shutdown,
            monitor_task,
            invalidation_task,
        } = std::mem::take(&mut *self.lock());

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(task) = monitor_task {
            if let Err(error) = task.await {
                warn!(%error, "Health monitor task failed");
            }
        }
        // The listener only ends when the event channel closes, which the client never does.
        if let Some(task) = invalidation_task {
            task.abort();
            let _ = task.await;
        }

        if let Some(instance_id) = self_instance {
            self.client.deregister(&instance_id).await?;
            info!(%instance_id, "Mesh integrator stopped");
        }
        Ok(())
    }

    /// Routable instances of `service`, served from the discovery cache.
    pub async fn healthy_instances(&self, service: &str) -> Vec<ServiceInstance> {
        self.discovery.resolve(service).await
    }

    /// Last published health snapshot.
    pub fn mesh_health(&self) -> MeshHealthSnapshot {
        self.monitor.snapshot()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<MeshHealthSnapshot> {
        self.monitor.subscribe()
    }

    pub fn add_dependency(&self, dependency: DependencyConfig) {
        self.monitor.add_dependency(dependency);
    }

    pub async fn register_partition(
        &self,
        partition_id: &str,
        owning_service: &str,
        metadata: BTreeMap<String, String>,
    ) -> MeshResult<PartitionRecord> {
        self.partitions
            .register_partition(partition_id, owning_service, metadata)
            .await
    }

    pub async fn heartbeat(&self, partition_id: &str) -> MeshResult<PartitionRecord> {
        self.partitions.heartbeat(partition_id).await
    }

    pub async fn deregister_partition(&self, partition_id: &str) -> MeshResult<()> {
        self.partitions.deregister_partition(partition_id).await
    }

    pub fn query_partition(&self, partition_id: &str) -> Option<PartitionRecord> {
        self.partitions.query(partition_id)
    }

    pub fn partition_owner(&self, partition_id: &str) -> Option<String> {
        self.partitions.owner_of(partition_id)
    }

    pub fn discovery_statistics(&self) -> CacheStatistics {
        self.discovery.statistics()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<RegistryClient> {
        &self.client
    }

    pub fn discovery(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MeshIntegrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshIntegrator")
            .field("client", &self.client)
            .field("discovery", &self.discovery)
            .field("partitions", &self.partitions)
            .field("monitor", &self.monitor)
            .finish()
    }
}
