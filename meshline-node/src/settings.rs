use anyhow::{bail, Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use meshline_core::ServiceDescriptor;
use meshline_mesh::resilience::{RetryConfig, TimeoutConfig};
use meshline_mesh::{
    DependencyConfig, DiscoveryConfig, MeshConfig, MonitorConfig, PartitionConfig,
    RegistryConfig,
};
use meshline_tracing::TracerConfig;
use serde::Deserialize;
use std::time::Duration;

/// Node settings, layered from `config/default`, `config/local` and `MESHLINE__*` variables
/// (e.g. `MESHLINE__REGISTRY__BACKEND=consul`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub service: ServiceSettings,
    pub registry: RegistrySettings,
    pub discovery: DiscoverySettings,
    pub monitor: MonitorSettings,
    pub partitions: PartitionSettings,
    pub tracing: TracingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
    /// Full `EnvFilter` directive; overrides `level` when set
    pub filter: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            filter: None,
        }
    }
}

/// How this process registers itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub name: String,
    /// Defaults to `{name}-{port}`
    pub instance_id: Option<String>,
    /// Address advertised to the registry
    pub address: String,
    pub health_path: String,
    pub tags: Vec<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "meshline".to_string(),
            instance_id: None,
            address: "127.0.0.1".to_string(),
            health_path: "/health".to_string(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    #[default]
    Memory,
    Consul,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub backend: RegistryBackend,
    pub consul_url: String,
    pub consul_token: Option<String>,
    pub check_interval_ms: u64,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub timeout_ms: u64,
    pub event_capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::default(),
            consul_url: "http://127.0.0.1:8500".to_string(),
            consul_token: None,
            check_interval_ms: 10_000,
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
            timeout_ms: 2_000,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub ttl_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self { ttl_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_ms: u64,
    pub probe_deadline_ms: u64,
    pub probe_sample_rate: f64,
    pub dependencies: Vec<DependencyConfig>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            probe_deadline_ms: 3_000,
            probe_sample_rate: 1.0,
            dependencies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PartitionSettings {
    pub degraded_after_ms: u64,
    pub unavailable_after_ms: u64,
    pub key_prefix: String,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            degraded_after_ms: 30_000,
            unavailable_after_ms: 90_000,
            key_prefix: "meshline/partitions".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    #[default]
    Log,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracingSettings {
    pub sampling_rate: f64,
    pub max_traces: usize,
    pub max_spans_per_trace: usize,
    pub flush_interval_ms: u64,
    pub export_timeout_ms: u64,
    pub exporter: ExporterKind,
    pub collector_url: Option<String>,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            sampling_rate: 1.0,
            max_traces: 1024,
            max_spans_per_trace: 1000,
            flush_interval_ms: 5_000,
            export_timeout_ms: 10_000,
            exporter: ExporterKind::default(),
            collector_url: None,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let loader = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("MESHLINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read settings")?;

        let settings: Settings = loader
            .try_deserialize()
            .context("failed to parse settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracing.exporter == ExporterKind::Http && self.tracing.collector_url.is_none() {
            bail!("tracing.collector_url is required when tracing.exporter = \"http\"");
        }
        if self.service.name.is_empty() {
            bail!("service.name cannot be empty");
        }
        self.mesh_config()
            .validate()
            .context("invalid mesh settings")?;
        self.tracer_config()
            .validate()
            .context("invalid tracing settings")?;
        Ok(())
    }

    pub fn instance_id(&self) -> String {
        self.service
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.service.name, self.server.port))
    }

    pub fn descriptor(&self) -> ServiceDescriptor {
        let mut descriptor = ServiceDescriptor::new(
            self.service.name.clone(),
            self.instance_id(),
            self.service.address.clone(),
            self.server.port,
        );
        descriptor.health_path = self.service.health_path.clone();
        descriptor.tags = self.service.tags.clone();
        descriptor
    }

    pub fn mesh_config(&self) -> MeshConfig {
        let registry = &self.registry;
        MeshConfig {
            registry: RegistryConfig {
                retry: RetryConfig {
                    max_attempts: registry.max_attempts,
                    initial_delay: millis(registry.initial_delay_ms),
                    max_delay: millis(registry.max_delay_ms),
                    multiplier: registry.multiplier,
                    jitter: registry.jitter,
                },
                timeouts: TimeoutConfig::new(millis(registry.timeout_ms)),
                event_capacity: registry.event_capacity,
            },
            discovery: DiscoveryConfig {
                ttl: millis(self.discovery.ttl_ms),
            },
            monitor: MonitorConfig {
                interval: millis(self.monitor.interval_ms),
                probe_deadline: millis(self.monitor.probe_deadline_ms),
                probe_sample_rate: self.monitor.probe_sample_rate,
                dependencies: self.monitor.dependencies.clone(),
            },
            partitions: PartitionConfig {
                degraded_after: millis(self.partitions.degraded_after_ms),
                unavailable_after: millis(self.partitions.unavailable_after_ms),
                key_prefix: self.partitions.key_prefix.clone(),
            },
        }
    }

    pub fn tracer_config(&self) -> TracerConfig {
        TracerConfig::builder()
            .service_name(self.service.name.clone())
            .sampling_rate(self.tracing.sampling_rate)
            .max_traces(self.tracing.max_traces)
            .max_spans_per_trace(self.tracing.max_spans_per_trace)
            .flush_interval(millis(self.tracing.flush_interval_ms))
            .export_timeout(millis(self.tracing.export_timeout_ms))
            .build()
    }

    pub fn request_timeout(&self) -> Duration {
        millis(self.server.request_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        millis(self.registry.check_interval_ms)
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
