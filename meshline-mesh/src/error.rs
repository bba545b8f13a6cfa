use meshline_core::CoreError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the mesh integrator.
#[derive(Error, Debug, Clone)]
pub enum MeshError {
    /// Retries exhausted against the registry.
    #[error("Registry unavailable for {operation} after {attempts} attempts: {reason}")]
    RegistryUnavailable {
        operation: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("Health check of {instance_id} timed out after {after:?}")]
    HealthCheckTimeout { instance_id: String, after: Duration },

    /// A single registry call exceeded its timeout. Retried by [`RegistryClient`](crate::RegistryClient).
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Transport or server failure that may succeed on retry.
    #[error("Registry transport error: {0}")]
    Transport(String),

    /// Non-transient protocol error (rejected request, malformed response).
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl MeshError {
    /// Whether another attempt of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MeshError::Timeout { .. } | MeshError::Transport(_))
    }
}

pub type MeshResult<T> = Result<T, MeshError>;

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        let client_error = err.status().is_some_and(|s| s.is_client_error());
        if err.is_decode() || client_error {
            MeshError::Registry(err.to_string())
        } else {
            MeshError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MeshError::Transport("connection refused".into()).is_transient());
        assert!(MeshError::Timeout {
            operation: "discover",
            after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!MeshError::Registry("bad request".into()).is_transient());
        assert!(!MeshError::PartitionNotFound("p-1".into()).is_transient());
    }

    #[test]
    fn test_unavailable_display() {
        let err = MeshError::RegistryUnavailable {
            operation: "discover",
            attempts: 5,
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Registry unavailable for discover after 5 attempts: connection refused"
        );
    }
}
