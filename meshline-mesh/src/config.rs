//! Mesh integrator configuration.
//!
//! Every numeric knob has a default; [`MeshConfig::validate`] rejects combinations that cannot
//! work (zero intervals, inverted heartbeat windows, out-of-range rates).
//!
//! # Example
//!
//! ```rust
//! use meshline_mesh::config::{DependencyConfig, MeshConfig};
//! use std::time::Duration;
//!
//! let config = MeshConfig::builder()
//!     .discovery_ttl(Duration::from_secs(10))
//!     .monitor_interval(Duration::from_secs(5))
//!     .dependency(DependencyConfig::required("billing"))
//!     .dependency(DependencyConfig::optional("search"))
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MeshError, MeshResult};
use crate::resilience::{RetryConfig, TimeoutConfig};

/// Registry client resilience settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Buffer of the registry event broadcast channel
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Age after which a cached instance list is refreshed from the registry
    pub ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
        }
    }
}

/// A service this process depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub service: String,
    /// Required dependencies decide the overall health verdict.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl DependencyConfig {
    pub fn required(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            required: true,
        }
    }

    pub fn optional(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Time between the start of two monitoring cycles
    pub interval: Duration,
    /// Budget of one dependency probe within a cycle
    pub probe_deadline: Duration,
    /// Fraction of instances health-checked per cycle (at least one per service)
    pub probe_sample_rate: f64,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_deadline: Duration::from_secs(3),
            probe_sample_rate: 1.0,
            dependencies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Silence after which an active partition becomes degraded
    pub degraded_after: Duration,
    /// Silence after which a degraded partition becomes unavailable
    pub unavailable_after: Duration,
    /// Registry key prefix under which partition records are persisted
    pub key_prefix: String,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            degraded_after: Duration::from_secs(30),
            unavailable_after: Duration::from_secs(90),
            key_prefix: "meshline/partitions".to_string(),
        }
    }
}

impl PartitionConfig {
    pub(crate) fn key(&self, partition_id: &str) -> String {
        format!("{}/{}", self.key_prefix.trim_end_matches('/'), partition_id)
    }
}

/// Complete mesh integrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub partitions: PartitionConfig,
}

impl MeshConfig {
    pub fn builder() -> MeshConfigBuilder {
        MeshConfigBuilder::default()
    }

    pub fn validate(&self) -> MeshResult<()> {
        let retry = &self.registry.retry;
        if retry.max_attempts == 0 {
            return Err(MeshError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if retry.multiplier < 1.0 {
            return Err(MeshError::Config("retry.multiplier must be >= 1.0".to_string()));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(MeshError::Config(
                "retry.initial_delay cannot exceed retry.max_delay".to_string(),
            ));
        }
        if self.registry.timeouts.default.is_zero() {
            return Err(MeshError::Config("registry timeout must be non-zero".to_string()));
        }
        if self.registry.event_capacity == 0 {
            return Err(MeshError::Config("event_capacity must be greater than 0".to_string()));
        }
        if self.monitor.interval.is_zero() || self.monitor.probe_deadline.is_zero() {
            return Err(MeshError::Config(
                "monitor interval and probe deadline must be non-zero".to_string(),
            ));
        }
        if !(self.monitor.probe_sample_rate > 0.0 && self.monitor.probe_sample_rate <= 1.0) {
            return Err(MeshError::Config(
                "probe_sample_rate must be in (0.0, 1.0]".to_string(),
            ));
        }
        if self.partitions.degraded_after.is_zero() {
            return Err(MeshError::Config("degraded_after must be non-zero".to_string()));
        }
        if self.partitions.unavailable_after <= self.partitions.degraded_after {
            return Err(MeshError::Config(
                "unavailable_after must be greater than degraded_after".to_string(),
            ));
        }
        if self.partitions.key_prefix.is_empty() {
            return Err(MeshError::Config("partition key_prefix cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Builder for MeshConfig
#[derive(Debug, Default)]
pub struct MeshConfigBuilder {
    config: MeshConfig,
}

impl MeshConfigBuilder {
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.registry.retry = retry;
        self
    }

    pub fn registry_timeout(mut self, timeout: Duration) -> Self {
        self.config.registry.timeouts.default = timeout;
        self
    }

    pub fn operation_timeout(mut self, operation: impl Into<String>, timeout: Duration) -> Self {
        self.config
            .registry
            .timeouts
            .operation_specific
            .insert(operation.into(), timeout);
        self
    }

    pub fn discovery_ttl(mut self, ttl: Duration) -> Self {
        self.config.discovery.ttl = ttl;
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor.interval = interval;
        self
    }

    pub fn probe_deadline(mut self, deadline: Duration) -> Self {
        self.config.monitor.probe_deadline = deadline;
        self
    }

    pub fn probe_sample_rate(mut self, rate: f64) -> Self {
        self.config.monitor.probe_sample_rate = rate;
        self
    }

    pub fn dependency(mut self, dependency: DependencyConfig) -> Self {
        self.config.monitor.dependencies.push(dependency);
        self
    }

    pub fn heartbeat_windows(mut self, degraded_after: Duration, unavailable_after: Duration) -> Self {
        self.config.partitions.degraded_after = degraded_after;
        self.config.partitions.unavailable_after = unavailable_after;
        self
    }

    pub fn partition_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.partitions.key_prefix = prefix.into();
        self
    }

    pub fn build(self) -> MeshConfig {
        self.config
    }
}
