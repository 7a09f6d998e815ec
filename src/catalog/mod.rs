//! Dataset metadata catalog
//!
//! Describes which datasets exist and, for each, its integer fields, string
//! fields, field aliases and dimension metrics. The compiler only reads it.
//!
//! # Format
//!
//! ```text
//! [[datasets]]
//! name = "jobsearch"
//! int_fields = ["unixtime", "clicks"]
//! string_fields = ["country", "q"]
//!
//! [datasets.field_aliases]
//! query = "q"
//!
//! [datasets.dimensions]
//! ctr = "clicks * 100 / count()"
//! ```

mod source;

pub use source::{source_from_config, FileSource, HttpSource, MetadataSource, StaticSource};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading metadata
#[derive(Error, Debug)]
pub enum CatalogError {
    /// I/O failure reading a metadata file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata document could not be decoded
    #[error("Invalid metadata: {0}")]
    Format(String),

    /// Remote metadata fetch failed
    #[error("Metadata fetch failed: {0}")]
    Fetch(String),
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Format(err.to_string())
    }
}

impl From<toml::de::Error> for CatalogError {
    fn from(err: toml::de::Error) -> Self {
        CatalogError::Format(err.to_string())
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        CatalogError::Fetch(err.to_string())
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Physical type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    String,
    /// Integer in some datasets and string in others
    Conflicted,
}

impl FieldType {
    pub fn is_int(&self) -> bool {
        matches!(self, FieldType::Integer)
    }
}

/// Schema of one dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub name: String,

    #[serde(default)]
    pub int_fields: Vec<String>,

    #[serde(default)]
    pub string_fields: Vec<String>,

    /// alias -> physical field name
    #[serde(default)]
    pub field_aliases: BTreeMap<String, String>,

    /// alias -> doc metric expression
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl DatasetMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_int_fields(mut self, fields: &[&str]) -> Self {
        self.int_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_string_fields(mut self, fields: &[&str]) -> Self {
        self.string_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_alias(mut self, alias: &str, field: &str) -> Self {
        self.field_aliases
            .insert(alias.to_string(), field.to_string());
        self
    }

    pub fn with_dimension(mut self, alias: &str, expression: &str) -> Self {
        self.dimensions
            .insert(alias.to_string(), expression.to_string());
        self
    }

    /// Physical name of an int field, matched case-insensitively
    pub fn int_field(&self, name: &str) -> Option<&str> {
        find_ignore_case(&self.int_fields, name)
    }

    /// Physical name of a string field, matched case-insensitively
    pub fn string_field(&self, name: &str) -> Option<&str> {
        find_ignore_case(&self.string_fields, name)
    }

    pub fn has_int_field(&self, name: &str) -> bool {
        self.int_field(name).is_some()
    }

    pub fn has_string_field(&self, name: &str) -> bool {
        self.string_field(name).is_some()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.has_int_field(name) || self.has_string_field(name)
    }

    /// Follows a field alias, matched case-insensitively
    pub fn alias_target(&self, name: &str) -> Option<&str> {
        self.field_aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .map(|(_, target)| target.as_str())
    }

    /// Dimension expression for an alias, matched case-insensitively
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .map(|(_, expr)| expr.as_str())
    }
}

fn find_ignore_case<'a>(fields: &'a [String], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|f| f.as_str() == name)
        .or_else(|| fields.iter().find(|f| f.eq_ignore_ascii_case(name)))
        .map(|f| f.as_str())
}

/// All known datasets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetCatalog {
    #[serde(default)]
    datasets: Vec<DatasetMetadata>,
}

impl DatasetCatalog {
    pub fn new(datasets: Vec<DatasetMetadata>) -> Self {
        Self { datasets }
    }

    pub fn from_toml_str(text: &str) -> CatalogResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> CatalogResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a `.toml` or `.json` file
    pub fn load<P: AsRef<Path>>(path: P) -> CatalogResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::parse(path, &text)
    }

    pub(crate) fn parse(path: &Path, text: &str) -> CatalogResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(text),
            _ => Self::from_toml_str(text),
        }
    }

    pub fn datasets(&self) -> &[DatasetMetadata] {
        &self.datasets
    }

    pub fn insert(&mut self, metadata: DatasetMetadata) {
        self.datasets.retain(|d| d.name != metadata.name);
        self.datasets.push(metadata);
    }

    /// Exact name lookup
    pub fn get(&self, name: &str) -> Option<&DatasetMetadata> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// Exact match first, then a unique case-insensitive match
    pub fn resolve(&self, name: &str) -> Result<&DatasetMetadata, String> {
        if let Some(exact) = self.get(name) {
            return Ok(exact);
        }
        let matches: Vec<&DatasetMetadata> = self
            .datasets
            .iter()
            .filter(|d| d.name.eq_ignore_ascii_case(name))
            .collect();
        match matches.as_slice() {
            [single] => Ok(single),
            [] => Err(format!(
                "Dataset not found or not included in query: \"{}\"",
                name
            )),
            many => Err(format!(
                "Multiple datasets match, and none are an exact match: [{}], seeking \"{}\"",
                many.iter()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                name
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[datasets]]
name = "jobsearch"
int_fields = ["unixtime", "clicks"]
string_fields = ["country"]

[datasets.field_aliases]
geo = "country"

[datasets.dimensions]
double_clicks = "clicks * 2"
"#;

    #[test]
    fn test_parse_toml() {
        let catalog = DatasetCatalog::from_toml_str(SAMPLE).unwrap();
        let ds = catalog.get("jobsearch").unwrap();
        assert!(ds.has_int_field("CLICKS"));
        assert_eq!(ds.string_field("Country"), Some("country"));
        assert_eq!(ds.alias_target("GEO"), Some("country"));
        assert_eq!(ds.dimension("double_clicks"), Some("clicks * 2"));
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"datasets":[{"name":"a","int_fields":["x"]}]}"#;
        let catalog = DatasetCatalog::from_json_str(json).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("a").unwrap().has_int_field("x"));
    }

    #[test]
    fn test_resolve_case_insensitive() {
        let catalog = DatasetCatalog::new(vec![
            DatasetMetadata::new("Organic"),
            DatasetMetadata::new("sponsored"),
        ]);
        assert_eq!(catalog.resolve("organic").unwrap().name, "Organic");
        assert!(catalog
            .resolve("missing")
            .unwrap_err()
            .starts_with("Dataset not found"));
    }

    #[test]
    fn test_resolve_ambiguous() {
        let catalog = DatasetCatalog::new(vec![
            DatasetMetadata::new("ABC"),
            DatasetMetadata::new("abc"),
        ]);
        assert_eq!(catalog.resolve("abc").unwrap().name, "abc");
        let err = catalog.resolve("Abc").unwrap_err();
        assert!(err.starts_with("Multiple datasets match"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let catalog = DatasetCatalog::load(&path).unwrap();
        assert!(catalog.get("jobsearch").is_some());
    }
}
