//! In-process registry backend.
//!
//! Backs the `memory` deployment mode and the test suites. Failures, rejections and delays can
//! be scripted per operation, and every call is counted.

use async_trait::async_trait;
use dashmap::DashMap;
use meshline_core::{HealthStatus, ServiceDescriptor, ServiceInstance};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{Registry, HEALTH_PATH_META};
use crate::error::{MeshError, MeshResult};

/// Scripted misbehavior for the next calls of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Transient transport failure
    Unavailable,
    /// Non-transient protocol error
    Reject,
    /// Sleep before serving the call normally
    Delay(Duration),
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    services: DashMap<String, BTreeMap<String, ServiceInstance>>,
    kv: DashMap<String, String>,
    health: DashMap<String, HealthStatus>,
    probe_delays: DashMap<String, Duration>,
    faults: Mutex<HashMap<&'static str, VecDeque<Fault>>>,
    calls: DashMap<&'static str, u32>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an instance directly, bypassing `register`.
    pub fn insert_instance(&self, instance: ServiceInstance) {
        self.services
            .entry(instance.service_name.clone())
            .or_default()
            .insert(instance.instance_id.clone(), instance);
    }

    /// Status returned by `health_check` (and reported by `discover`) for an instance.
    pub fn set_health(&self, instance_id: impl Into<String>, status: HealthStatus) {
        self.health.insert(instance_id.into(), status);
    }

    /// Makes `health_check` of an instance take `delay`.
    pub fn set_probe_delay(&self, instance_id: impl Into<String>, delay: Duration) {
        self.probe_delays.insert(instance_id.into(), delay);
    }

    /// Applies `fault` to the next `times` calls of `operation`.
    pub fn script(&self, operation: &'static str, fault: Fault, times: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = faults.entry(operation).or_default();
        queue.extend(std::iter::repeat(fault).take(times));
    }

    /// Number of calls `operation` has received.
    pub fn calls(&self, operation: &str) -> u32 {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    async fn enter(&self, operation: &'static str) -> MeshResult<()> {
        *self.calls.entry(operation).or_insert(0) += 1;

        let fault = {
            let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
            faults.get_mut(operation).and_then(VecDeque::pop_front)
        };

        match fault {
            None => Ok(()),
            Some(Fault::Unavailable) => Err(MeshError::Transport(format!(
                "{operation}: connection refused"
            ))),
            Some(Fault::Reject) => Err(MeshError::Registry(format!("{operation}: rejected"))),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    fn current_health(&self, instance: &ServiceInstance) -> HealthStatus {
        self.health
            .get(&instance.instance_id)
            .map(|status| *status)
            .unwrap_or(instance.health_status)
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register(&self, descriptor: &ServiceDescriptor) -> MeshResult<()> {
        self.enter("register").await?;
        let instance = descriptor
            .to_instance()
            .with_metadata(HEALTH_PATH_META, descriptor.health_path.clone());
        self.insert_instance(instance);
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> MeshResult<()> {
        self.enter("deregister").await?;
        for mut service in self.services.iter_mut() {
            service.value_mut().remove(instance_id);
        }
        self.services.retain(|_, instances| !instances.is_empty());
        Ok(())
    }

    async fn discover(&self, service: &str) -> MeshResult<Vec<ServiceInstance>> {
        self.enter("discover").await?;
        let instances = self
            .services
            .get(service)
            .map(|instances| {
                instances
                    .values()
                    .map(|instance| {
                        let status = self.current_health(instance);
                        instance.clone().with_health(status)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(instances)
    }

    async fn put_kv(&self, key: &str, value: &str) -> MeshResult<()> {
        self.enter("put_kv").await?;
        self.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> MeshResult<Option<String>> {
        self.enter("get_kv").await?;
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    async fn delete_kv(&self, key: &str) -> MeshResult<()> {
        self.enter("delete_kv").await?;
        self.kv.remove(key);
        Ok(())
    }

    async fn health_check(&self, instance: &ServiceInstance) -> MeshResult<HealthStatus> {
        self.enter("health_check").await?;
        let delay = self.probe_delays.get(&instance.instance_id).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.current_health(instance))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
