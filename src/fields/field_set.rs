//! Resolved field identifiers
//!
//! A [`FieldSet`] maps every dataset in its scope to the physical field name
//! the logical field refers to there. Names differ when a dataset aliases
//! the field.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::language::{
    AggregateMetric, CompileError, CompileResult, DocFilter, DocMetric,
};

/// A field resolved against one or more datasets
#[derive(Debug, Clone)]
pub struct FieldSet {
    dataset_to_field: BTreeMap<String, String>,
    /// Set when the scope was narrowed below the enclosing query scope
    restricted: bool,
}

impl PartialEq for FieldSet {
    fn eq(&self, other: &Self) -> bool {
        self.dataset_to_field == other.dataset_to_field
    }
}

impl Eq for FieldSet {}

impl FieldSet {
    pub fn new(dataset_to_field: BTreeMap<String, String>) -> Self {
        Self {
            dataset_to_field,
            restricted: false,
        }
    }

    /// Field in a single dataset
    pub fn single(dataset: impl Into<String>, field: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(dataset.into(), field.into());
        Self::new(map)
    }

    /// Same physical field name in every listed dataset
    pub fn uniform<I, S>(datasets: I, field: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            datasets
                .into_iter()
                .map(|d| (d.into(), field.to_string()))
                .collect(),
        )
    }

    pub fn datasets(&self) -> BTreeSet<String> {
        self.dataset_to_field.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.dataset_to_field
            .iter()
            .map(|(d, f)| (d.as_str(), f.as_str()))
    }

    pub fn len(&self) -> usize {
        self.dataset_to_field.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset_to_field.is_empty()
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn contains_dataset(&self, dataset: &str) -> bool {
        self.dataset_to_field.contains_key(dataset)
    }

    /// Physical field name in `dataset`
    pub fn dataset_field_name(&self, dataset: &str) -> CompileResult<&str> {
        self.dataset_to_field
            .get(dataset)
            .map(|f| f.as_str())
            .ok_or_else(|| CompileError::UnknownDataset(dataset.to_string()))
    }

    fn uniform_name(&self) -> Option<&str> {
        let mut names = self.dataset_to_field.values();
        let first = names.next()?;
        names.all(|n| n == first).then_some(first.as_str())
    }

    fn per_dataset_names(&self) -> String {
        let parts: Vec<String> = self
            .dataset_to_field
            .iter()
            .map(|(d, n)| format!("{}.{}", d, n))
            .collect();
        format!("{{{}}}", parts.join(", "))
    }

    /// The physical name, when every dataset agrees on it
    pub fn only_field(&self) -> CompileResult<&str> {
        if self.is_empty() {
            return Err(CompileError::Invalid("Empty field set".to_string()));
        }
        self.uniform_name().ok_or_else(|| {
            CompileError::Invalid(format!(
                "Field has different names in different datasets: {}",
                self.per_dataset_names()
            ))
        })
    }

    /// Narrow to `datasets`, which must already be in scope
    pub fn subset(&self, datasets: &BTreeSet<String>) -> CompileResult<FieldSet> {
        let mut narrowed = BTreeMap::new();
        for dataset in datasets {
            let field = self.dataset_field_name(dataset)?;
            narrowed.insert(dataset.clone(), field.to_string());
        }
        Ok(FieldSet {
            dataset_to_field: narrowed,
            restricted: true,
        })
    }

    pub fn wrap_doc_filter(&self, filter: DocFilter) -> DocFilter {
        if self.restricted {
            DocFilter::Qualified {
                datasets: self.datasets(),
                filter: Box::new(filter),
            }
        } else {
            filter
        }
    }

    pub fn wrap_aggregate_metric(&self, metric: AggregateMetric) -> AggregateMetric {
        if self.restricted {
            AggregateMetric::Qualified {
                datasets: self.datasets(),
                metric: Box::new(metric),
            }
        } else {
            metric
        }
    }

    /// Doc metrics can only be qualified to one dataset
    pub fn wrap_doc_metric(&self, metric: DocMetric) -> CompileResult<DocMetric> {
        if !self.restricted {
            return Ok(metric);
        }
        match self.dataset_to_field.keys().next() {
            Some(dataset) if self.len() == 1 => Ok(DocMetric::Qualified {
                dataset: dataset.clone(),
                metric: Box::new(metric),
            }),
            _ => Err(CompileError::Invalid(
                "Too large scope for a DocMetric!".to_string(),
            )),
        }
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uniform_name() {
            Some(name) => f.write_str(name),
            None => f.write_str(&self.per_dataset_names()),
        }
    }
}

impl Serialize for FieldSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.dataset_to_field.len()))?;
        for (dataset, field) in &self.dataset_to_field {
            map.serialize_entry(dataset, field)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_datasets() -> FieldSet {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), "country".to_string());
        map.insert("b".to_string(), "geo".to_string());
        FieldSet::new(map)
    }

    #[test]
    fn test_dataset_field_name() {
        let field = two_datasets();
        assert_eq!(field.dataset_field_name("b").unwrap(), "geo");
        assert_eq!(
            field.dataset_field_name("c").unwrap_err(),
            CompileError::UnknownDataset("c".to_string())
        );
        assert_eq!(field.to_string(), "{a.country, b.geo}");
        assert_eq!(
            field.only_field().unwrap_err(),
            CompileError::Invalid(
                "Field has different names in different datasets: {a.country, b.geo}".to_string()
            )
        );
        assert_eq!(FieldSet::uniform(["a", "b"], "country").to_string(), "country");
    }

    #[test]
    fn test_equality_ignores_restriction() {
        let field = two_datasets();
        let narrowed = field.subset(&field.datasets()).unwrap();
        assert!(narrowed.is_restricted());
        assert_eq!(field, narrowed);
    }

    #[test]
    fn test_subset_requires_known_dataset() {
        let field = two_datasets();
        let scope: BTreeSet<String> = ["c".to_string()].into_iter().collect();
        assert!(field.subset(&scope).is_err());
    }

    #[test]
    fn test_wrap_doc_metric() {
        let field = two_datasets();
        let metric = DocMetric::Field(field.clone());
        assert_eq!(field.wrap_doc_metric(metric.clone()).unwrap(), metric);

        let one: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let narrowed = field.subset(&one).unwrap();
        let wrapped = narrowed.wrap_doc_metric(metric.clone()).unwrap();
        assert!(matches!(wrapped, DocMetric::Qualified { ref dataset, .. } if dataset == "a"));

        let both = field.subset(&field.datasets()).unwrap();
        assert_eq!(
            both.wrap_doc_metric(metric).unwrap_err().to_string(),
            "Invalid query: Too large scope for a DocMetric!"
        );
    }

    #[test]
    fn test_serialize_as_map() {
        let json = serde_json::to_value(FieldSet::single("a", "f")).unwrap();
        assert_eq!(json, serde_json::json!({"a": "f"}));
    }
}
