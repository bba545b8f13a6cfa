//! Service mesh integration: registry access with retries and timeouts, cached discovery,
//! background dependency health monitoring and partition ownership tracking.
//!
//! [`MeshIntegrator`] wires the pieces together; each one is also usable on its own.

pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod http;
pub mod integrator;
pub mod partition;
pub mod registry;
pub mod resilience;

pub use config::{
    DependencyConfig, DiscoveryConfig, MeshConfig, MeshConfigBuilder, MonitorConfig,
    PartitionConfig, RegistryConfig,
};
pub use discovery::{CacheStatistics, DiscoveryCache};
pub use error::{MeshError, MeshResult};
pub use health::HealthMonitor;
pub use http::{router, HealthReport, HealthState};
pub use integrator::MeshIntegrator;
pub use partition::{PartitionManager, PartitionView};
pub use registry::{
    ConsulRegistry, Fault, InMemoryRegistry, Registry, RegistryClient, RegistryEvent,
};
