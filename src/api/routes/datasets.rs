//! Dataset Routes
//!
//! - GET /api/v1/datasets - List the catalog the server compiles against

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::dto::{DatasetSummary, DatasetsResponse};
use crate::api::error::ApiResult;
use crate::api::state::AppState;

/// GET /api/v1/datasets
pub async fn list_datasets(State(state): State<Arc<AppState>>) -> ApiResult<Json<DatasetsResponse>> {
    let catalog = state.catalog().await?;
    let mut datasets: Vec<DatasetSummary> = catalog.datasets().iter().map(DatasetSummary::from).collect();
    datasets.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(DatasetsResponse {
        source: state.source.name().to_string(),
        datasets,
    }))
}
