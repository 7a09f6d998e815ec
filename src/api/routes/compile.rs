//! Compile Routes
//!
//! - POST /api/v1/compile - Compile a query, optionally against an inline catalog
//! - GET /api/v1/compile?q= - Compile against the server's catalog

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use crate::api::dto::{CompileParams, CompileRequest, CompileResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::catalog::DatasetCatalog;

/// POST /api/v1/compile
pub async fn compile_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompileRequest>,
) -> ApiResult<Json<CompileResponse>> {
    let catalog = match req.catalog {
        Some(catalog) => catalog,
        None => state.catalog().await?,
    };
    run(&state, catalog, req.query, req.now.unwrap_or_else(Utc::now)).await
}

/// GET /api/v1/compile?q=
pub async fn compile_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CompileParams>,
) -> ApiResult<Json<CompileResponse>> {
    let catalog = state.catalog().await?;
    run(&state, catalog, params.q, Utc::now()).await
}

async fn run(
    state: &AppState,
    catalog: DatasetCatalog,
    query: String,
    now: DateTime<Utc>,
) -> ApiResult<Json<CompileResponse>> {
    if query.trim().is_empty() {
        return Err(ApiError::Validation("query cannot be empty".to_string()));
    }

    let compiler = state.compiler(catalog);
    let started = Instant::now();
    let compiled = tokio::task::spawn_blocking(move || compiler.compile_at(&query, now))
        .await
        .map_err(|e| ApiError::Internal(format!("Compile task failed: {}", e)))??;
    let elapsed = started.elapsed().as_millis() as u64;

    tracing::info!(
        commands = compiled.commands.len(),
        warnings = compiled.warnings.len(),
        elapsed_ms = elapsed,
        "Compiled query"
    );
    Ok(Json(CompileResponse::new(compiled, elapsed)))
}
