//! HTTP health endpoints.
//!
//! - `GET /health` - latest [`MeshHealthSnapshot`]; 200 when healthy, 503 otherwise
//! - `GET /health/live` - process liveness, always 200
//!
//! Handlers read the last published snapshot and never trigger a probe.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use meshline_core::MeshHealthSnapshot;
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;

use crate::resilience::timeout::middleware::request_timeout;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state of the health handlers.
#[derive(Clone)]
pub struct HealthState {
    snapshots: watch::Receiver<MeshHealthSnapshot>,
}

impl HealthState {
    pub fn new(snapshots: watch::Receiver<MeshHealthSnapshot>) -> Self {
        Self { snapshots }
    }
}

/// Snapshot response carrying its own HTTP status.
#[derive(Debug, Clone)]
pub struct HealthReport(pub MeshHealthSnapshot);

impl HealthReport {
    pub fn status_code(&self) -> StatusCode {
        if self.0.overall {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.0)).into_response()
    }
}

/// Builds the health router.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .layer(middleware::from_fn(|request, next| {
            request_timeout(request, next, REQUEST_TIMEOUT)
        }))
        .with_state(state)
}

/// GET /health
pub async fn health_handler(State(state): State<HealthState>) -> HealthReport {
    HealthReport(state.snapshots.borrow().clone())
}

/// GET /health/live
pub async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "alive" })))
}
