//! JQL REST API
//!
//! HTTP API layer for the compiler, built with Axum.
//!
//! # Endpoints
//!
//! ## Compile
//! - `POST /api/v1/compile` - Compile `{"query": ..., "catalog"?: ..., "now"?: ...}`
//! - `GET /api/v1/compile?q=` - Compile against the server's catalog
//!
//! ## Catalog
//! - `GET /api/v1/datasets` - List known datasets
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,no_run
//! use jql::api::{serve, AppState};
//! use jql::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     serve(AppState::from_config(&config), &config.api).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route(
            "/compile",
            post(routes::compile::compile_query).get(routes::compile::compile_get),
        )
        .route("/datasets", get(routes::datasets::list_datasets))
        // Inline catalogs can be large
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let cors_enabled = state.config.cors_enabled;
    let shared_state = Arc::new(state);

    let router = Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http());

    let router = if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };
    router.with_state(shared_state)
}

/// Start the API server
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let source = state.source.name().to_string();
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(catalog = %source, "JQL API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("JQL API shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatasetCatalog, DatasetMetadata, FileSource, StaticSource};
    use crate::config::CompileConfig;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use tower::util::ServiceExt;

    fn create_test_app() -> Router {
        let catalog = DatasetCatalog::new(vec![DatasetMetadata::new("jobsearch")
            .with_int_fields(&["clicks", "unixtime"])
            .with_string_fields(&["country", "q"])]);
        let state = AppState::new(
            Arc::new(StaticSource::new(catalog)),
            CompileConfig::default(),
            ApiConfig::default(),
        );
        build_router(state)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_compile(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/compile")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_live() {
        let response = create_test_app()
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_ready_and_full() {
        let app = create_test_app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["datasets"], 1);
    }

    #[tokio::test]
    async fn test_health_ready_without_catalog() {
        let state = AppState::new(
            Arc::new(FileSource::new("/nonexistent/jql/datasets.toml")),
            CompileConfig::default(),
            ApiConfig::default(),
        );
        let response = build_router(state)
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_compile_post() {
        let response = create_test_app()
            .oneshot(post_compile(
                r#"{"query": "FROM jobsearch 2024-01-01 2024-01-02 WHERE country = us GROUP BY q[5] SELECT count()", "now": "2024-01-03T00:00:00Z"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["commands"][0]["command"], "applyFilterActions");
        assert_eq!(body["datasets"][0]["name"], "jobsearch");
        assert!(body["cache_key"]["file_name"].as_str().unwrap().starts_with("JQL-"));
    }

    #[tokio::test]
    async fn test_compile_get() {
        let uri = format!(
            "/api/v1/compile?q={}",
            urlencoding::encode("FROM jobsearch 2024-01-01 2024-01-02 SELECT count()")
        );
        let response = create_test_app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_compile_inline_catalog() {
        let response = create_test_app()
            .oneshot(post_compile(
                r#"{"query": "FROM other 2024-01-01 2024-01-02 SELECT count()", "catalog": {"datasets": [{"name": "other"}]}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_compile_parse_error() {
        let response = create_test_app()
            .oneshot(post_compile(r#"{"query": "FROM jobsearch\nSELECT count("}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "PARSE_ERROR");
        assert_eq!(body["error"]["line"], 2);
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_compile_unknown_field() {
        let response = create_test_app()
            .oneshot(post_compile(r#"{"query": "FROM jobsearch WHERE nope = 1"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "COMPILE_ERROR");
        assert!(!body["error"]["details"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compile_invalid_json() {
        let response = create_test_app().oneshot(post_compile("not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_datasets() {
        let response = create_test_app()
            .oneshot(Request::builder().uri("/api/v1/datasets").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["source"], "static");
        assert_eq!(body["datasets"][0]["name"], "jobsearch");
        assert_eq!(body["datasets"][0]["int_fields"], 2);
    }
}
