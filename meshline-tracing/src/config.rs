//! Tracer configuration.
//!
//! # Example
//!
//! ```rust
//! use meshline_tracing::config::TracerConfig;
//! use std::time::Duration;
//!
//! let config = TracerConfig::builder()
//!     .service_name("orders")
//!     .sampling_rate(0.25)
//!     .max_traces(512)
//!     .flush_interval(Duration::from_secs(2))
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{TraceError, TraceResult};

/// Tracer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// Service name recorded by exporters (e.g., "orders")
    pub service_name: String,

    /// Sampling rate applied to root spans (0.0 to 1.0)
    pub sampling_rate: f64,

    /// Maximum number of traces buffered before the oldest is evicted
    pub max_traces: usize,

    /// Maximum spans buffered per trace
    pub max_spans_per_trace: usize,

    /// Interval of the background flush loop
    pub flush_interval: Duration,

    /// Timeout for a single export call
    pub export_timeout: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            service_name: "meshline".to_string(),
            sampling_rate: 1.0,
            max_traces: 1024,
            max_spans_per_trace: 1000,
            flush_interval: Duration::from_secs(5),
            export_timeout: Duration::from_secs(10),
        }
    }
}

impl TracerConfig {
    /// Create a new builder for TracerConfig
    pub fn builder() -> TracerConfigBuilder {
        TracerConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> TraceResult<()> {
        if self.service_name.is_empty() {
            return Err(TraceError::Config("Service name cannot be empty".to_string()));
        }

        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(TraceError::Config(
                "Sampling rate must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.max_traces == 0 {
            return Err(TraceError::Config("max_traces must be greater than 0".to_string()));
        }

        if self.max_spans_per_trace == 0 {
            return Err(TraceError::Config(
                "max_spans_per_trace must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval.is_zero() {
            return Err(TraceError::Config("flush_interval must be non-zero".to_string()));
        }

        Ok(())
    }
}

/// Builder for TracerConfig
#[derive(Default)]
pub struct TracerConfigBuilder {
    service_name: Option<String>,
    sampling_rate: Option<f64>,
    max_traces: Option<usize>,
    max_spans_per_trace: Option<usize>,
    flush_interval: Option<Duration>,
    export_timeout: Option<Duration>,
}

impl TracerConfigBuilder {
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = Some(rate);
        self
    }

    pub fn max_traces(mut self, max: usize) -> Self {
        self.max_traces = Some(max);
        self
    }

    pub fn max_spans_per_trace(mut self, max: usize) -> Self {
        self.max_spans_per_trace = Some(max);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> TracerConfig {
        let default = TracerConfig::default();
        TracerConfig {
            service_name: self.service_name.unwrap_or(default.service_name),
            sampling_rate: self.sampling_rate.unwrap_or(default.sampling_rate),
            max_traces: self.max_traces.unwrap_or(default.max_traces),
            max_spans_per_trace: self.max_spans_per_trace.unwrap_or(default.max_spans_per_trace),
            flush_interval: self.flush_interval.unwrap_or(default.flush_interval),
            export_timeout: self.export_timeout.unwrap_or(default.export_timeout),
        }
    }
}
