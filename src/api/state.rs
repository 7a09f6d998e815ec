//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::catalog::{source_from_config, CatalogResult, DatasetCatalog, MetadataSource};
use crate::config::{CompileConfig, Config};
use crate::query::Compiler;

pub use crate::config::ApiConfig;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Where the dataset catalog is read from on every request
    pub source: Arc<dyn MetadataSource>,
    pub compile: Arc<CompileConfig>,
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(source: Arc<dyn MetadataSource>, compile: CompileConfig, config: ApiConfig) -> Self {
        Self {
            source,
            compile: Arc::new(compile),
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            source_from_config(&config.catalog),
            config.compile.clone(),
            config.api.clone(),
        )
    }

    /// Fetch the current catalog
    pub async fn catalog(&self) -> CatalogResult<DatasetCatalog> {
        self.source.fetch().await
    }

    /// Compiler over `catalog` using the server's compile settings
    pub fn compiler(&self, catalog: DatasetCatalog) -> Compiler {
        Compiler::new(catalog, self.compile.as_ref().clone())
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
