//! Validation support
//!
//! Problems found while resolving and validating a query are collected
//! instead of returned one at a time, so a single compile reports all of them.

use serde::Serialize;
use std::collections::BTreeMap;

use super::error::{CompileError, CompileResult};
use crate::catalog::DatasetMetadata;

/// Accumulates errors and warnings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorCollector {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.errors.contains(&message) {
            self.errors.push(message);
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ErrorCollector) {
        for e in other.errors {
            self.error(e);
        }
        for w in other.warnings {
            self.warn(w);
        }
    }

    /// Fail with every collected error, or hand back the warnings
    pub fn into_result(self) -> CompileResult<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(CompileError::Validation(self.errors))
        }
    }
}

/// Schema lookups used by `validate`, keyed by the query's dataset names
#[derive(Debug, Clone, Default)]
pub struct ValidationHelper {
    datasets: BTreeMap<String, DatasetMetadata>,
}

impl ValidationHelper {
    pub fn new(datasets: BTreeMap<String, DatasetMetadata>) -> Self {
        Self { datasets }
    }

    pub fn contains_dataset(&self, dataset: &str) -> bool {
        self.datasets.contains_key(dataset)
    }

    pub fn contains_int_field(&self, dataset: &str, field: &str) -> bool {
        self.datasets
            .get(dataset)
            .map(|d| d.has_int_field(field))
            .unwrap_or(false)
    }

    pub fn contains_string_field(&self, dataset: &str, field: &str) -> bool {
        self.datasets
            .get(dataset)
            .map(|d| d.has_string_field(field))
            .unwrap_or(false)
    }

    pub fn contains_field(&self, dataset: &str, field: &str) -> bool {
        self.contains_int_field(dataset, field) || self.contains_string_field(dataset, field)
    }

    /// Report a missing field of any type
    pub fn validate_field(&self, dataset: &str, field: &str, context: &str, errors: &mut ErrorCollector) {
        if !self.contains_field(dataset, field) {
            errors.error(missing_field(dataset, field, context));
        }
    }

    pub fn validate_int_field(&self, dataset: &str, field: &str, context: &str, errors: &mut ErrorCollector) {
        if !self.contains_int_field(dataset, field) {
            errors.error(format!(
                "{}. Expected int field \"{}\" in dataset \"{}\"",
                missing_field(dataset, field, context),
                field,
                dataset
            ));
        }
    }

    pub fn validate_string_field(&self, dataset: &str, field: &str, context: &str, errors: &mut ErrorCollector) {
        if !self.contains_string_field(dataset, field) {
            errors.error(format!(
                "{}. Expected string field \"{}\" in dataset \"{}\"",
                missing_field(dataset, field, context),
                field,
                dataset
            ));
        }
    }
}

pub(crate) fn missing_field(dataset: &str, field: &str, context: &str) -> String {
    format!(
        "Field not found: \"{}\" in dataset \"{}\" (in {})",
        field, dataset, context
    )
}

pub(crate) fn validate_regex(pattern: &str, errors: &mut ErrorCollector) {
    if let Err(e) = regex::Regex::new(pattern) {
        errors.error(format!("Invalid pattern: {} ({})", pattern, e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helper() -> ValidationHelper {
        let mut datasets = BTreeMap::new();
        datasets.insert(
            "js".to_string(),
            DatasetMetadata::new("jobsearch")
                .with_int_fields(&["clicks"])
                .with_string_fields(&["country"]),
        );
        ValidationHelper::new(datasets)
    }

    #[test]
    fn test_collector_dedups() {
        let mut errors = ErrorCollector::new();
        errors.error("boom");
        errors.error("boom");
        errors.warn("hmm");
        assert_eq!(errors.errors().len(), 1);
        assert_eq!(errors.clone().into_result().unwrap_err(), CompileError::Validation(vec!["boom".into()]));
    }

    #[test]
    fn test_collector_warnings_only() {
        let mut errors = ErrorCollector::new();
        errors.warn("careful");
        assert_eq!(errors.into_result().unwrap(), vec!["careful".to_string()]);
    }

    #[test]
    fn test_field_checks() {
        let helper = helper();
        assert!(helper.contains_int_field("js", "clicks"));
        assert!(!helper.contains_int_field("js", "country"));
        assert!(helper.contains_field("js", "COUNTRY"));

        let mut errors = ErrorCollector::new();
        helper.validate_int_field("js", "country", "test", &mut errors);
        helper.validate_field("js", "clicks", "test", &mut errors);
        assert_eq!(errors.errors().len(), 1);
    }

    #[test]
    fn test_validate_regex() {
        let mut errors = ErrorCollector::new();
        validate_regex("a(b", &mut errors);
        validate_regex("ab.*", &mut errors);
        assert_eq!(errors.errors().len(), 1);
        assert!(errors.errors()[0].starts_with("Invalid pattern: a(b"));
    }
}
