//! Dependency health monitoring.
//!
//! Each cycle probes every dependency concurrently, refreshes partition heartbeats, and
//! publishes a complete [`MeshHealthSnapshot`] through a watch channel. Readers always see
//! the last finished cycle and never wait on a probe in progress.

use chrono::Utc;
use futures::future::join_all;
use meshline_core::{HealthStatus, MeshHealthSnapshot, SamplingDecider, ServiceInstance};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{DependencyConfig, MonitorConfig};
use crate::partition::PartitionManager;
use crate::registry::RegistryClient;

pub struct HealthMonitor {
    client: Arc<RegistryClient>,
    partitions: Arc<PartitionManager>,
    interval: Duration,
    probe_deadline: Duration,
    probe_sample_rate: f64,
    dependencies: RwLock<Vec<DependencyConfig>>,
    snapshot: watch::Sender<MeshHealthSnapshot>,
    cycles: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        client: Arc<RegistryClient>,
        partitions: Arc<PartitionManager>,
        config: &MonitorConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(MeshHealthSnapshot::initial());
        Self {
            client,
            partitions,
            interval: config.interval,
            probe_deadline: config.probe_deadline,
            probe_sample_rate: config.probe_sample_rate,
            dependencies: RwLock::new(config.dependencies.clone()),
            snapshot,
            cycles: AtomicU64::new(0),
        }
    }

    /// Adds a dependency, replacing any existing entry for the same service.
    pub fn add_dependency(&self, dependency: DependencyConfig) {
        let mut dependencies = self
            .dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        dependencies.retain(|existing| existing.service != dependency.service);
        info!(service = %dependency.service, required = dependency.required, "Dependency added");
        dependencies.push(dependency);
    }

    pub fn dependencies(&self) -> Vec<DependencyConfig> {
        self.dependencies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> MeshHealthSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeshHealthSnapshot> {
        self.snapshot.subscribe()
    }

    /// Runs one monitoring cycle and publishes its snapshot.
    pub async fn run_cycle(&self) -> MeshHealthSnapshot {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let dependencies = self.dependencies();
        let started = Instant::now();

        let probes = dependencies.iter().map(|dependency| async move {
            let service = dependency.service.as_str();
            let status = match timeout(self.probe_deadline, self.probe_service(service, cycle)).await
            {
                Ok(status) => status,
                Err(_) => {
                    warn!(service, deadline = ?self.probe_deadline, "Dependency probe exceeded deadline");
                    HealthStatus::Critical
                }
            };
            (dependency.service.clone(), status)
        });
        let per_service: BTreeMap<String, HealthStatus> = join_all(probes).await.into_iter().collect();

        let transitions = self
            .partitions
            .refresh(Utc::now(), self.probe_deadline)
            .await;
        if !transitions.is_empty() {
            debug!(cycle, transitions = transitions.len(), "Partition statuses changed");
        }

        let snapshot = MeshHealthSnapshot::aggregate(
            per_service,
            self.partitions.statuses(),
            dependencies
                .iter()
                .filter(|dependency| dependency.required)
                .map(|dependency| dependency.service.as_str()),
            cycle,
        );

        metrics::gauge!("meshline_mesh_healthy").set(if snapshot.overall { 1.0 } else { 0.0 });
        metrics::histogram!("meshline_health_cycle_seconds").record(started.elapsed().as_secs_f64());
        debug!(
            cycle,
            overall = snapshot.overall,
            services = snapshot.per_service.len(),
            partitions = snapshot.per_partition.len(),
            "Health cycle completed"
        );

        self.snapshot.send_replace(snapshot.clone());
        snapshot
    }

    /// Runs cycles every `interval` until `shutdown` flips to true or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }

    /// Best status among the probed instances of `service`; no instances means critical.
    async fn probe_service(&self, service: &str, cycle: u64) -> HealthStatus {
        let instances = match self.client.discover(service).await {
            Ok(instances) => instances,
            Err(error) => {
                warn!(service, %error, "Dependency discovery failed");
                return HealthStatus::Critical;
            }
        };
        if instances.is_empty() {
            debug!(service, "Dependency has no instances");
            return HealthStatus::Critical;
        }

        let checks = self
            .select_for_probe(&instances, cycle)
            .into_iter()
            .map(|instance| async move {
                match self.client.health_check(instance).await {
                    // The registry's own view can only make a probe result worse.
                    Ok(probed) => probed.worst(instance.health_status),
                    Err(error) => {
                        debug!(instance_id = %instance.instance_id, %error, "Instance probe failed");
                        HealthStatus::Critical
                    }
                }
            });

        join_all(checks)
            .await
            .into_iter()
            .fold(HealthStatus::Critical, HealthStatus::best)
    }

    fn select_for_probe<'a>(
        &self,
        instances: &'a [ServiceInstance],
        cycle: u64,
    ) -> Vec<&'a ServiceInstance> {
        if self.probe_sample_rate >= 1.0 {
            return instances.iter().collect();
        }

        let mut selected: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|instance| {
                SamplingDecider::decide_key(
                    &format!("{}:{cycle}", instance.instance_id),
                    self.probe_sample_rate,
                )
            })
            .collect();

        if selected.is_empty() {
            // Rotate through instances so none goes unprobed forever.
            let index = (cycle % instances.len() as u64) as usize;
            selected.extend(instances.get(index));
        }
        selected
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("interval", &self.interval)
            .field("probe_deadline", &self.probe_deadline)
            .field("probe_sample_rate", &self.probe_sample_rate)
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish()
    }
}
