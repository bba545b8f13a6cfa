use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::CoreError;

/// Health of a service instance as reported by the registry or a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Returns true for statuses that may receive traffic.
    pub fn is_routable(&self) -> bool {
        matches!(self, HealthStatus::Passing | HealthStatus::Warning)
    }

    /// Combines two statuses, returning the worse one.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }

    /// Combines two statuses, returning the better one.
    pub fn best(self, other: HealthStatus) -> HealthStatus {
        self.min(other)
    }

    /// Parses the status strings registries commonly use. Unknown values map to critical.
    pub fn from_registry(value: &str) -> HealthStatus {
        match value.to_ascii_lowercase().as_str() {
            "passing" => HealthStatus::Passing,
            "warning" => HealthStatus::Warning,
            _ => HealthStatus::Critical,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One resolved instance of a service. Rebuilt on every discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub health_status: HealthStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            port,
            health_status: HealthStatus::Passing,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_health(mut self, status: HealthStatus) -> Self {
        self.health_status = status;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `address:port`, suitable for building request URLs.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// What a process registers about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Path probed on the instance to determine its health.
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ServiceDescriptor {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            health_path: default_health_path(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.service_name.is_empty() {
            return Err(CoreError::Validation("service name cannot be empty".to_string()));
        }
        if self.instance_id.is_empty() {
            return Err(CoreError::Validation("instance id cannot be empty".to_string()));
        }
        if self.address.is_empty() {
            return Err(CoreError::Validation("address cannot be empty".to_string()));
        }
        if !self.health_path.starts_with('/') {
            return Err(CoreError::Validation(format!(
                "health path must start with '/': {}",
                self.health_path
            )));
        }
        Ok(())
    }

    /// The instance record other services will discover for this descriptor.
    pub fn to_instance(&self) -> ServiceInstance {
        ServiceInstance {
            service_name: self.service_name.clone(),
            instance_id: self.instance_id.clone(),
            address: self.address.clone(),
            port: self.port,
            health_status: HealthStatus::Passing,
            metadata: self.metadata.clone(),
        }
    }
}
