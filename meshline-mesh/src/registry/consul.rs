//! Consul HTTP API backend.

use async_trait::async_trait;
use meshline_core::{HealthStatus, ServiceDescriptor, ServiceInstance};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{Registry, HEALTH_PATH_META};
use crate::error::{MeshError, MeshResult};

const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: BTreeMap<String, String>,
    check: AgentServiceCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "HTTP")]
    http: String,
    interval: String,
    timeout: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    node: NodeEntry,
    service: ServiceDetails,
    #[serde(default)]
    checks: Vec<CheckEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceDetails {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckEntry {
    status: String,
}

impl ServiceEntry {
    fn into_instance(self) -> ServiceInstance {
        // No checks means Consul has nothing against the instance.
        let health = self
            .checks
            .iter()
            .map(|check| HealthStatus::from_registry(&check.status))
            .fold(HealthStatus::Passing, HealthStatus::worst);

        let address = if self.service.address.is_empty() {
            self.node.address
        } else {
            self.service.address
        };

        ServiceInstance {
            service_name: self.service.service,
            instance_id: self.service.id,
            address,
            port: self.service.port,
            health_status: health,
            metadata: self.service.meta.unwrap_or_default(),
        }
    }
}

/// Registry backed by a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    check_interval: Duration,
}

impl ConsulRegistry {
    /// `base_url` is the agent address, e.g. `http://127.0.0.1:8500`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> MeshResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| MeshError::Config(format!("failed to build HTTP client: {e}")))?;
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| MeshError::Config(format!("invalid Consul address: {base_url}")))?;

        Ok(Self {
            client,
            base_url,
            token,
            check_interval: Duration::from_secs(10),
        })
    }

    /// Interval of the HTTP check Consul runs against registered instances.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Appends `segments` to the agent address, percent-encoding each one.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> MeshResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| MeshError::Config(format!("invalid Consul address: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// KV keys are hierarchical; `/` separates segments.
    fn kv_endpoint(&self, key: &str) -> MeshResult<Url> {
        self.endpoint(["v1", "kv"].into_iter().chain(key.split('/')))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, descriptor: &ServiceDescriptor) -> MeshResult<()> {
        let mut meta = descriptor.metadata.clone();
        meta.insert(HEALTH_PATH_META.to_string(), descriptor.health_path.clone());

        let body = AgentServiceRegistration {
            id: &descriptor.instance_id,
            name: &descriptor.service_name,
            address: &descriptor.address,
            port: descriptor.port,
            tags: &descriptor.tags,
            meta,
            check: AgentServiceCheck {
                http: format!(
                    "http://{}:{}{}",
                    descriptor.address, descriptor.port, descriptor.health_path
                ),
                interval: format!("{}s", self.check_interval.as_secs().max(1)),
                timeout: "2s".to_string(),
            },
        };

        let url = self.endpoint(["v1", "agent", "service", "register"])?;
        self.request(reqwest::Method::PUT, url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> MeshResult<()> {
        let url = self.endpoint(["v1", "agent", "service", "deregister", instance_id])?;
        self.request(reqwest::Method::PUT, url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn discover(&self, service: &str) -> MeshResult<Vec<ServiceInstance>> {
        let url = self.endpoint(["v1", "health", "service", service])?;
        let entries: Vec<ServiceEntry> = self
            .request(reqwest::Method::GET, url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(service, instances = entries.len(), "Consul discovery");
        Ok(entries.into_iter().map(ServiceEntry::into_instance).collect())
    }

    async fn put_kv(&self, key: &str, value: &str) -> MeshResult<()> {
        let accepted: bool = self
            .request(reqwest::Method::PUT, self.kv_endpoint(key)?)
            .body(value.to_string())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if accepted {
            Ok(())
        } else {
            Err(MeshError::Registry(format!("Consul refused write of {key}")))
        }
    }

    async fn get_kv(&self, key: &str) -> MeshResult<Option<String>> {
        let response = self
            .request(reqwest::Method::GET, self.kv_endpoint(key)?)
            .query(&[("raw", "true")])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.error_for_status()?.text().await?;
        Ok(Some(body))
    }

    async fn delete_kv(&self, key: &str) -> MeshResult<()> {
        self.request(reqwest::Method::DELETE, self.kv_endpoint(key)?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn health_check(&self, instance: &ServiceInstance) -> MeshResult<HealthStatus> {
        let path = instance
            .metadata
            .get(HEALTH_PATH_META)
            .map(String::as_str)
            .unwrap_or("/health");
        let url = format!("http://{}{}", instance.authority(), path);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                debug!(instance_id = %instance.instance_id, %error, "Probe failed");
                return Ok(HealthStatus::Critical);
            }
        };

        let status = response.status();
        Ok(if status.is_success() {
            HealthStatus::Passing
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        })
    }

    fn name(&self) -> &str {
        "consul"
    }
}
