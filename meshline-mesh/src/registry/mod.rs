//! Registry protocol boundary and the resilient client wrapped around it.
//!
//! [`Registry`] is what a backend has to implement; [`RegistryClient`] is what the rest of the
//! crate talks to. The client bounds every attempt with a timeout, retries transient failures
//! with exponential backoff, and turns exhaustion into [`MeshError::RegistryUnavailable`].

pub mod consul;
pub mod memory;

pub use consul::ConsulRegistry;
pub use memory::{Fault, InMemoryRegistry};

use async_trait::async_trait;
use dashmap::DashMap;
use meshline_core::{HealthStatus, ServiceDescriptor, ServiceInstance};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{MeshError, MeshResult};
use crate::resilience::{retry_if, with_timeout, ExponentialBackoff, RetryError, TimeoutConfig};

/// Instance metadata key carrying the HTTP path probed by health checks.
pub const HEALTH_PATH_META: &str = "health_path";

/// Operations every registry backend provides.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, descriptor: &ServiceDescriptor) -> MeshResult<()>;

    async fn deregister(&self, instance_id: &str) -> MeshResult<()>;

    async fn discover(&self, service: &str) -> MeshResult<Vec<ServiceInstance>>;

    async fn put_kv(&self, key: &str, value: &str) -> MeshResult<()>;

    async fn get_kv(&self, key: &str) -> MeshResult<Option<String>>;

    async fn delete_kv(&self, key: &str) -> MeshResult<()>;

    /// Probes one instance directly.
    async fn health_check(&self, instance: &ServiceInstance) -> MeshResult<HealthStatus>;

    /// Returns the name of this backend
    fn name(&self) -> &str;
}

/// Membership change observed through this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        service: String,
        instance_id: String,
    },
    Deregistered {
        service: Option<String>,
        instance_id: String,
    },
}

impl RegistryEvent {
    /// Service whose membership changed, when known.
    pub fn service(&self) -> Option<&str> {
        match self {
            RegistryEvent::Registered { service, .. } => Some(service),
            RegistryEvent::Deregistered { service, .. } => service.as_deref(),
        }
    }
}

/// Resilient front of a [`Registry`] backend.
pub struct RegistryClient {
    backend: Arc<dyn Registry>,
    policy: ExponentialBackoff,
    timeouts: TimeoutConfig,
    events: broadcast::Sender<RegistryEvent>,
    registered: DashMap<String, String>,
}

impl RegistryClient {
    pub fn new(backend: Arc<dyn Registry>, config: &RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            backend,
            policy: ExponentialBackoff::new(config.retry.clone()),
            timeouts: config.timeouts.clone(),
            events,
            registered: DashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Receives membership changes made through this client.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn register(&self, descriptor: &ServiceDescriptor) -> MeshResult<()> {
        descriptor.validate()?;
        self.call("register", || self.backend.register(descriptor)).await?;

        self.registered
            .insert(descriptor.instance_id.clone(), descriptor.service_name.clone());
        info!(
            service = %descriptor.service_name,
            instance_id = %descriptor.instance_id,
            backend = self.backend.name(),
            "Registered instance"
        );
        self.publish(RegistryEvent::Registered {
            service: descriptor.service_name.clone(),
            instance_id: descriptor.instance_id.clone(),
        });
        Ok(())
    }

    pub async fn deregister(&self, instance_id: &str) -> MeshResult<()> {
        self.call("deregister", || self.backend.deregister(instance_id))
            .await?;

        let service = self.registered.remove(instance_id).map(|(_, service)| service);
        info!(instance_id, ?service, "Deregistered instance");
        self.publish(RegistryEvent::Deregistered {
            service,
            instance_id: instance_id.to_string(),
        });
        Ok(())
    }

    pub async fn discover(&self, service: &str) -> MeshResult<Vec<ServiceInstance>> {
        self.call("discover", || self.backend.discover(service)).await
    }

    pub async fn put_kv(&self, key: &str, value: &str) -> MeshResult<()> {
        self.call("put_kv", || self.backend.put_kv(key, value)).await
    }

    pub async fn get_kv(&self, key: &str) -> MeshResult<Option<String>> {
        self.call("get_kv", || self.backend.get_kv(key)).await
    }

    pub async fn delete_kv(&self, key: &str) -> MeshResult<()> {
        self.call("delete_kv", || self.backend.delete_kv(key)).await
    }

    /// One timed probe, never retried. Expiry yields [`MeshError::HealthCheckTimeout`].
    pub async fn health_check(&self, instance: &ServiceInstance) -> MeshResult<HealthStatus> {
        let after = self.timeouts.get_timeout("health_check");
        match with_timeout("health_check", after, self.backend.health_check(instance)).await {
            Err(MeshError::Timeout { after, .. }) => {
                metrics::counter!("meshline_health_check_timeouts_total").increment(1);
                Err(MeshError::HealthCheckTimeout {
                    instance_id: instance.instance_id.clone(),
                    after,
                })
            }
            other => other,
        }
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> MeshResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = MeshResult<T>>,
    {
        let after = self.timeouts.get_timeout(operation);
        let result = retry_if(
            &self.policy,
            || with_timeout(operation, after, f()),
            MeshError::is_transient,
        )
        .await;

        match result {
            Ok(value) => {
                metrics::counter!("meshline_registry_calls_total", "operation" => operation, "outcome" => "ok")
                    .increment(1);
                Ok(value)
            }
            Err(RetryError { error, attempts }) if error.is_transient() => {
                metrics::counter!("meshline_registry_calls_total", "operation" => operation, "outcome" => "unavailable")
                    .increment(1);
                warn!(operation, attempts, %error, "Registry unavailable, retries exhausted");
                Err(MeshError::RegistryUnavailable {
                    operation,
                    attempts,
                    reason: error.to_string(),
                })
            }
            Err(RetryError { error, .. }) => {
                metrics::counter!("meshline_registry_calls_total", "operation" => operation, "outcome" => "error")
                    .increment(1);
                Err(error)
            }
        }
    }

    fn publish(&self, event: RegistryEvent) {
        if self.events.send(event).is_err() {
            debug!("No registry event subscribers");
        }
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RetryConfig;
    use std::time::Duration;

    fn client(backend: Arc<InMemoryRegistry>, max_attempts: u32) -> RegistryClient {
        let config = RegistryConfig {
            retry: RetryConfig {
                max_attempts,
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        RegistryClient::new(backend, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_registry_unavailable() {
        let backend = Arc::new(InMemoryRegistry::new());
        backend.script("discover", Fault::Unavailable, 10);
        let client = client(Arc::clone(&backend), 3);

        let err = client.discover("billing").await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::RegistryUnavailable { operation: "discover", attempts: 3, .. }
        ));
        assert_eq!(backend.calls("discover"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let backend = Arc::new(InMemoryRegistry::new());
        backend.script("put_kv", Fault::Reject, 1);
        let client = client(Arc::clone(&backend), 5);

        let err = client.put_kv("k", "v").await.unwrap_err();
        assert!(matches!(err, MeshError::Registry(_)));
        assert_eq!(backend.calls("put_kv"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_retries() {
        let backend = Arc::new(InMemoryRegistry::new());
        backend.script("get_kv", Fault::Delay(Duration::from_secs(60)), 1);
        backend.put_kv("k", "v").await.unwrap();
        let client = client(Arc::clone(&backend), 5);

        assert_eq!(client.get_kv("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(backend.calls("get_kv"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_timeout() {
        let backend = Arc::new(InMemoryRegistry::new());
        let instance = ServiceInstance::new("billing", "billing-1", "10.0.0.1", 80);
        backend.set_probe_delay("billing-1", Duration::from_secs(60));
        let client = client(Arc::clone(&backend), 5);

        let err = client.health_check(&instance).await.unwrap_err();
        assert!(matches!(err, MeshError::HealthCheckTimeout { .. }));
        assert_eq!(backend.calls("health_check"), 1);
    }

    #[tokio::test]
    async fn test_register_publishes_events() {
        let backend = Arc::new(InMemoryRegistry::new());
        let client = client(backend, 5);
        let mut events = client.subscribe();

        let descriptor = ServiceDescriptor::new("orders", "orders-1", "10.0.0.2", 8080);
        client.register(&descriptor).await.unwrap();
        client.deregister("orders-1").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Registered {
                service: "orders".to_string(),
                instance_id: "orders-1".to_string()
            }
        );
        assert_eq!(events.recv().await.unwrap().service(), Some("orders"));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_rejected_before_io() {
        let backend = Arc::new(InMemoryRegistry::new());
        let client = client(Arc::clone(&backend), 5);

        let descriptor = ServiceDescriptor::new("", "x", "10.0.0.2", 8080);
        assert!(matches!(client.register(&descriptor).await, Err(MeshError::Core(_))));
        assert_eq!(backend.calls("register"), 0);
    }
}
