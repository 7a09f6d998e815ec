//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (catalog can be loaded)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health/live
///
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.catalog().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(source = state.source.name(), error = %e, "Catalog not ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /health
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (status, catalog, datasets) = match state.catalog().await {
        Ok(catalog) => ("healthy", "ok".to_string(), catalog.len()),
        Err(e) => ("degraded", e.to_string(), 0),
    };

    Json(HealthResponse {
        status: status.to_string(),
        catalog,
        datasets,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let status = liveness().await;
        assert_eq!(status, StatusCode::OK);
    }
}
