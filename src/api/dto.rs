//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{DatasetCatalog, DatasetMetadata};
use crate::language::{Command, Dataset};
use crate::query::CompiledQuery;

// ============================================
// COMPILE DTOs
// ============================================

/// Compile request
#[derive(Debug, Deserialize)]
pub struct CompileRequest {
    /// Query text
    pub query: String,
    /// Catalog to compile against instead of the server's
    #[serde(default)]
    pub catalog: Option<DatasetCatalog>,
    /// Reference time for relative dates, defaults to now
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

/// `GET /compile?q=`
#[derive(Debug, Deserialize)]
pub struct CompileParams {
    pub q: String,
}

/// Compile response
#[derive(Debug, Serialize)]
pub struct CompileResponse {
    pub commands: Vec<Command>,
    pub warnings: Vec<String>,
    pub datasets: Vec<DatasetDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<u64>,
    pub cache_key: CacheKeyDto,
    pub meta: CompileMeta,
}

#[derive(Debug, Serialize)]
pub struct DatasetDto {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl From<&Dataset> for DatasetDto {
    fn from(dataset: &Dataset) -> Self {
        Self {
            name: dataset.dataset.clone(),
            alias: dataset.alias.clone(),
            start: dataset.start.map(|t| t.to_rfc3339()),
            end: dataset.end.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CacheKeyDto {
    pub hash: String,
    pub file_name: String,
}

#[derive(Debug, Serialize)]
pub struct CompileMeta {
    pub compile_time_ms: u64,
    pub command_count: usize,
}

impl CompileResponse {
    pub fn new(compiled: CompiledQuery, compile_time_ms: u64) -> Self {
        Self {
            meta: CompileMeta {
                compile_time_ms,
                command_count: compiled.commands.len(),
            },
            datasets: compiled.datasets.iter().map(DatasetDto::from).collect(),
            cache_key: CacheKeyDto {
                hash: format!("{:08x}", compiled.cache_key.hash),
                file_name: compiled.cache_key.file_name,
            },
            row_limit: compiled.row_limit,
            warnings: compiled.warnings,
            commands: compiled.commands,
        }
    }
}

// ============================================
// CATALOG DTOs
// ============================================

/// One dataset of the catalog
#[derive(Debug, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub int_fields: usize,
    pub string_fields: usize,
    pub field_aliases: Vec<String>,
    pub dimensions: Vec<String>,
}

impl From<&DatasetMetadata> for DatasetSummary {
    fn from(metadata: &DatasetMetadata) -> Self {
        Self {
            name: metadata.name.clone(),
            int_fields: metadata.int_fields.len(),
            string_fields: metadata.string_fields.len(),
            field_aliases: metadata.field_aliases.keys().cloned().collect(),
            dimensions: metadata.dimensions.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DatasetsResponse {
    pub source: String,
    pub datasets: Vec<DatasetSummary>,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" or "degraded"
    pub status: String,
    /// "ok" or the catalog error
    pub catalog: String,
    pub datasets: usize,
    pub uptime_seconds: u64,
    pub version: String,
}
