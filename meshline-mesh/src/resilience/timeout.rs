//! Per-operation timeouts for registry calls and HTTP handlers.
//!
//! Expiry drops the wrapped future, which cancels whatever I/O it had in flight.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{MeshError, MeshResult};

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Default timeout for all operations
    pub default: Duration,
    /// Operation-specific timeouts, keyed by operation name (e.g. "discover")
    #[serde(default)]
    pub operation_specific: HashMap<String, Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(2),
            operation_specific: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            operation_specific: HashMap::new(),
        }
    }

    /// Add an operation-specific timeout
    pub fn with_operation(mut self, operation: impl Into<String>, timeout: Duration) -> Self {
        self.operation_specific.insert(operation.into(), timeout);
        self
    }

    /// Get timeout for a specific operation
    pub fn get_timeout(&self, operation: &str) -> Duration {
        self.operation_specific
            .get(operation)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Bounds `future` by `duration`, mapping expiry to [`MeshError::Timeout`].
pub async fn with_timeout<F, T>(operation: &'static str, duration: Duration, future: F) -> MeshResult<T>
where
    F: Future<Output = MeshResult<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(MeshError::Timeout {
            operation,
            after: duration,
        }),
    }
}

/// Middleware for request timeouts in axum
pub mod middleware {
    use super::*;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::middleware::Next;
    use axum::response::{IntoResponse, Response};

    /// Apply timeout to axum request handlers
    ///
    /// ```no_run
    /// use axum::{middleware, routing::get, Router};
    /// use meshline_mesh::resilience::timeout::middleware::request_timeout;
    /// use std::time::Duration;
    ///
    /// # async fn handler() -> &'static str { "ok" }
    /// let app: Router = Router::new()
    ///     .route("/", get(handler))
    ///     .layer(middleware::from_fn(|req, next| {
    ///         request_timeout(req, next, Duration::from_secs(5))
    ///     }));
    /// ```
    pub async fn request_timeout(request: Request, next: Next, timeout_duration: Duration) -> Response {
        match timeout(timeout_duration, next.run(request)).await {
            Ok(response) => response,
            Err(_) => (
                StatusCode::REQUEST_TIMEOUT,
                format!("Request timed out after {:?}", timeout_duration),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_succeeds() {
        let result = with_timeout("discover", Duration::from_secs(1), async {
            sleep(Duration::from_millis(100)).await;
            Ok(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_times_out() {
        let result: MeshResult<()> = with_timeout("register", Duration::from_millis(100), async {
            sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(MeshError::Timeout { operation: "register", .. })
        ));
    }

    #[tokio::test]
    async fn test_with_timeout_propagates_error() {
        let result: MeshResult<()> = with_timeout("get_kv", Duration::from_secs(1), async {
            Err(MeshError::Registry("forbidden".to_string()))
        })
        .await;

        assert!(matches!(result, Err(MeshError::Registry(_))));
    }

    #[test]
    fn test_timeout_config_with_operation() {
        let config = TimeoutConfig::new(Duration::from_secs(2))
            .with_operation("discover", Duration::from_millis(500))
            .with_operation("health_check", Duration::from_secs(1));

        assert_eq!(config.get_timeout("discover"), Duration::from_millis(500));
        assert_eq!(config.get_timeout("health_check"), Duration::from_secs(1));
        assert_eq!(config.get_timeout("put_kv"), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_inner_future() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        let result = with_timeout("put_kv", Duration::from_millis(100), async move {
            sleep(Duration::from_secs(10)).await;
            flag_clone.store(true, Ordering::Relaxed);
            Ok(())
        })
        .await;

        assert!(result.is_err());
        sleep(Duration::from_secs(20)).await;
        assert!(!flag.load(Ordering::Relaxed));
    }
}
