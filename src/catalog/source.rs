//! Metadata sources
//!
//! The compiler asks a [`MetadataSource`] for the catalog once per request.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use super::{CatalogError, CatalogResult, DatasetCatalog};
use crate::config::CatalogConfig;

/// Something that can produce a dataset catalog
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Fetch the current catalog
    async fn fetch(&self) -> CatalogResult<DatasetCatalog>;
}

/// Fixed, in-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    catalog: DatasetCatalog,
}

impl StaticSource {
    pub fn new(catalog: DatasetCatalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl MetadataSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> CatalogResult<DatasetCatalog> {
        Ok(self.catalog.clone())
    }
}

/// Catalog file on disk, re-read on every fetch
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MetadataSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self) -> CatalogResult<DatasetCatalog> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let catalog = DatasetCatalog::parse(&self.path, &text)?;
        tracing::debug!(
            path = %self.path.display(),
            datasets = catalog.len(),
            "Loaded dataset catalog"
        );
        Ok(catalog)
    }
}

/// Catalog served as JSON by another service
#[derive(Debug, Clone)]
pub struct HttpSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetadataSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self) -> CatalogResult<DatasetCatalog> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(CatalogError::Fetch(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        let text = response.text().await?;
        DatasetCatalog::from_json_str(&text)
    }
}

/// Pick a source from configuration: a URL wins over a file, and with
/// neither the catalog is empty
pub fn source_from_config(config: &CatalogConfig) -> Arc<dyn MetadataSource> {
    match (&config.url, &config.path) {
        (Some(url), _) => Arc::new(HttpSource::new(url.clone())),
        (None, Some(path)) => Arc::new(FileSource::new(path)),
        (None, None) => {
            tracing::warn!("No catalog configured, every dataset will be unknown");
            Arc::new(StaticSource::default())
        }
    }
}
