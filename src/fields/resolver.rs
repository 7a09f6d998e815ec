//! Name resolution against the catalog
//!
//! A query names datasets and fields the way the user typed them. The
//! [`FieldResolver`] knows every dataset in `FROM` (its scope name, catalog
//! metadata and `ALIASING` table) and turns typed names into [`FieldSet`]s.
//!
//! Resolution never stops at the first problem: a failed lookup records an
//! error and yields a sentinel name, so one compile reports every unknown
//! dataset and field at once.

use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::catalog::{DatasetCatalog, DatasetMetadata, FieldType};
use crate::fields::FieldSet;
use crate::language::plan::Dataset;
use crate::language::{ErrorCollector, ValidationHelper};

/// Stands in for a dataset name that could not be resolved
pub const FAILED_TO_RESOLVE_DATASET: &str = "FAILED_TO_RESOLVE_D";

/// Stands in for a field name that could not be resolved
pub const FAILED_TO_RESOLVE_FIELD: &str = "FAILED_TO_RESOLVE_F";

#[derive(Debug, Clone)]
struct ResolvedDataset {
    metadata: DatasetMetadata,
    /// Query-level `ALIASING (actual AS virtual)`: virtual -> physical
    aliases: BTreeMap<String, String>,
    /// Present in the catalog
    known: bool,
}

impl ResolvedDataset {
    fn field_name(&self, scope_name: &str, typed: &str) -> Result<String, String> {
        let target = lookup_ignore_case(&self.aliases, typed)
            .or_else(|| self.metadata.alias_target(typed))
            .unwrap_or(typed);
        if !self.known {
            return Ok(target.to_string());
        }
        self.metadata
            .int_field(target)
            .or_else(|| self.metadata.string_field(target))
            .map(|name| name.to_string())
            .ok_or_else(|| format!("Field not found in dataset \"{}\": \"{}\"", scope_name, typed))
    }

    fn field_type(&self, physical: &str) -> Option<FieldType> {
        match (
            self.metadata.has_int_field(physical),
            self.metadata.has_string_field(physical),
        ) {
            (true, true) => Some(FieldType::Conflicted),
            (true, false) => Some(FieldType::Integer),
            (false, true) => Some(FieldType::String),
            (false, false) => None,
        }
    }
}

fn lookup_ignore_case<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key)
        .or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
        .map(|v| v.as_str())
}

/// Every dataset of one query, keyed by scope name
#[derive(Debug, Clone)]
pub struct FieldResolver {
    datasets: BTreeMap<String, ResolvedDataset>,
    /// Names introduced by `metric AS name`
    metric_aliases: BTreeSet<String>,
}

impl FieldResolver {
    /// Resolve the `FROM` list against the catalog. Dataset names are
    /// rewritten to the catalog's spelling.
    pub fn build(
        catalog: &DatasetCatalog,
        datasets: &mut [Dataset],
        metric_aliases: BTreeSet<String>,
        errors: &mut ErrorCollector,
    ) -> Self {
        let mut resolved = BTreeMap::new();
        for dataset in datasets.iter_mut() {
            let (metadata, known) = match catalog.resolve(&dataset.dataset) {
                Ok(metadata) => {
                    dataset.dataset = metadata.name.clone();
                    (metadata.clone(), true)
                }
                Err(message) => {
                    errors.error(message);
                    (DatasetMetadata::new(dataset.dataset.clone()), false)
                }
            };
            // An alias may point at a catalog alias; store physical names
            let aliases: BTreeMap<String, String> = dataset
                .field_aliases
                .iter()
                .map(|(virtual_name, actual)| {
                    let physical = metadata.alias_target(actual).unwrap_or(actual.as_str());
                    (virtual_name.clone(), physical.to_string())
                })
                .collect();
            dataset.field_aliases = aliases.clone();
            let scope_name = dataset.scope_name().to_string();
            if resolved.contains_key(&scope_name) {
                errors.error(format!("Dataset name used twice: \"{}\"", scope_name));
            }
            resolved.insert(
                scope_name,
                ResolvedDataset {
                    metadata,
                    aliases,
                    known,
                },
            );
        }
        Self {
            datasets: resolved,
            metric_aliases,
        }
    }

    pub fn scope(&self) -> BTreeSet<String> {
        self.datasets.keys().cloned().collect()
    }

    pub fn universal_scope(&self) -> ScopedFieldResolver<'_> {
        ScopedFieldResolver {
            resolver: self,
            scope: self.scope(),
            restricted: false,
        }
    }

    /// Metadata keyed by scope name, for command validation
    pub fn validation_helper(&self) -> ValidationHelper {
        ValidationHelper::new(
            self.datasets
                .iter()
                .filter(|(_, d)| d.known)
                .map(|(name, d)| (name.clone(), d.metadata.clone()))
                .collect(),
        )
    }

    /// Canonical spelling of a `metric AS name` alias
    pub fn metric_alias(&self, typed: &str) -> Option<&str> {
        if let Some(exact) = self.metric_aliases.get(typed) {
            return Some(exact);
        }
        let mut matches = self
            .metric_aliases
            .iter()
            .filter(|a| a.eq_ignore_ascii_case(typed));
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }
}

/// A resolver restricted to part of the query's datasets
#[derive(Debug, Clone)]
pub struct ScopedFieldResolver<'a> {
    resolver: &'a FieldResolver,
    scope: BTreeSet<String>,
    /// Narrower than the query scope; resolved fields are marked restricted
    restricted: bool,
}

impl<'a> ScopedFieldResolver<'a> {
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn resolver(&self) -> &'a FieldResolver {
        self.resolver
    }

    /// Narrow to `scope`, which must be part of this scope
    pub fn for_scope(&self, scope: BTreeSet<String>) -> ScopedFieldResolver<'a> {
        let restricted = scope != self.resolver.scope();
        ScopedFieldResolver {
            resolver: self.resolver,
            scope,
            restricted,
        }
    }

    /// Exact name first, then a unique case-insensitive match
    pub fn resolve_dataset(&self, typed: &str, errors: &mut ErrorCollector) -> String {
        if self.scope.contains(typed) {
            return typed.to_string();
        }
        let matching: Vec<&String> = self
            .scope
            .iter()
            .filter(|d| d.eq_ignore_ascii_case(typed))
            .collect();
        match matching.as_slice() {
            [only] => only.to_string(),
            [] => {
                errors.error(format!(
                    "Dataset not found or not included in query: \"{}\"",
                    typed
                ));
                FAILED_TO_RESOLVE_DATASET.to_string()
            }
            many => {
                let names: Vec<&str> = many.iter().map(|d| d.as_str()).collect();
                errors.error(format!(
                    "Multiple datasets match, and none are an exact match: [{}], seeking \"{}\"",
                    names.join(", "),
                    typed
                ));
                FAILED_TO_RESOLVE_DATASET.to_string()
            }
        }
    }

    /// Resolve a plain field in every dataset of the scope
    pub fn resolve(&self, typed: &str, errors: &mut ErrorCollector) -> FieldSet {
        let mut map = BTreeMap::new();
        let is_metric_alias = self.resolver.metric_alias(typed).is_some();
        for dataset in &self.scope {
            let physical = if is_metric_alias {
                errors.error(format!("Metric alias cannot be used as a field: \"{}\"", typed));
                FAILED_TO_RESOLVE_FIELD.to_string()
            } else {
                match self.resolver.datasets.get(dataset) {
                    Some(resolved) => match resolved.field_name(dataset, typed) {
                        Ok(name) => name,
                        Err(message) => {
                            errors.error(message);
                            FAILED_TO_RESOLVE_FIELD.to_string()
                        }
                    },
                    None => {
                        errors.error(format!(
                            "Cannot resolve field for unresolved dataset: \"{}\"",
                            typed
                        ));
                        FAILED_TO_RESOLVE_FIELD.to_string()
                    }
                }
            };
            map.insert(dataset.clone(), physical);
        }
        let field = FieldSet::new(map);
        if self.restricted {
            field.subset(&self.scope).unwrap_or(field)
        } else {
            field
        }
    }

    /// Dimension expression for `typed` in `dataset`, if it names one
    pub fn dimension(&self, dataset: &str, typed: &str) -> Option<&'a str> {
        let resolved = self.resolver.datasets.get(dataset)?;
        if lookup_ignore_case(&resolved.aliases, typed).is_some() {
            return None;
        }
        resolved.metadata.dimension(typed)
    }

    /// Whether any dataset in scope defines `typed` as a dimension
    pub fn has_dimension(&self, typed: &str) -> bool {
        self.scope.iter().any(|d| self.dimension(d, typed).is_some())
    }

    /// Integer in every dataset, string in every dataset, or conflicted.
    /// Unresolved fields count as strings.
    pub fn field_type(&self, field: &FieldSet) -> FieldType {
        let mut any_int = false;
        let mut any_string = false;
        for (dataset, physical) in field.entries() {
            if dataset == FAILED_TO_RESOLVE_DATASET || physical == FAILED_TO_RESOLVE_FIELD {
                continue;
            }
            match self
                .resolver
                .datasets
                .get(dataset)
                .and_then(|d| d.field_type(physical))
            {
                Some(FieldType::Integer) => any_int = true,
                Some(FieldType::String) => any_string = true,
                Some(FieldType::Conflicted) => {
                    any_int = true;
                    any_string = true;
                }
                None => {}
            }
        }
        match (any_int, any_string) {
            (true, true) => FieldType::Conflicted,
            (true, false) => FieldType::Integer,
            (false, true) => FieldType::String,
            (false, false) => {
                warn!(field = %field, "field has no known type, defaulting to string");
                FieldType::String
            }
        }
    }

    pub fn is_int_field(&self, field: &FieldSet) -> bool {
        self.field_type(field).is_int()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DatasetCatalog {
        DatasetCatalog::new(vec![
            DatasetMetadata::new("jobsearch")
                .with_int_fields(&["clicks", "unixtime", "mixed"])
                .with_string_fields(&["country", "q"])
                .with_alias("geo", "country")
                .with_dimension("double_clicks", "clicks * 2"),
            DatasetMetadata::new("mobile")
                .with_int_fields(&["clicks"])
                .with_string_fields(&["geo_country", "mixed"]),
        ])
    }

    fn build(datasets: &mut Vec<Dataset>, errors: &mut ErrorCollector) -> FieldResolver {
        FieldResolver::build(&catalog(), datasets, ["total".to_string()].into_iter().collect(), errors)
    }

    #[test]
    fn test_dataset_names_follow_catalog() {
        let mut errors = ErrorCollector::new();
        let mut datasets = vec![Dataset::new("JobSearch")];
        let resolver = build(&mut datasets, &mut errors);
        assert!(!errors.has_errors());
        assert_eq!(datasets[0].dataset, "jobsearch");
        assert_eq!(resolver.scope().into_iter().collect::<Vec<_>>(), vec!["jobsearch"]);
    }

    #[test]
    fn test_unknown_dataset_is_collected() {
        let mut errors = ErrorCollector::new();
        let mut datasets = vec![Dataset::new("nope")];
        let resolver = build(&mut datasets, &mut errors);
        assert_eq!(errors.errors().len(), 1);
        // fields of an unknown dataset pass through without further errors
        let field = resolver.universal_scope().resolve("anything", &mut errors);
        assert_eq!(field.dataset_field_name("nope").unwrap(), "anything");
        assert_eq!(errors.errors().len(), 1);
    }

    #[test]
    fn test_resolve_dataset() {
        let mut errors = ErrorCollector::new();
        let mut a = Dataset::new("jobsearch");
        a.alias = Some("js".into());
        let mut b = Dataset::new("jobsearch");
        b.alias = Some("JS".into());
        let mut datasets = vec![a, b];
        let resolver = build(&mut datasets, &mut errors);
        let scoped = resolver.universal_scope();
        assert_eq!(scoped.resolve_dataset("JS", &mut errors), "JS");
        assert_eq!(scoped.resolve_dataset("Js", &mut errors), FAILED_TO_RESOLVE_DATASET);
        assert!(errors.errors()[0].starts_with("Multiple datasets match"));
        assert_eq!(scoped.resolve_dataset("other", &mut errors), FAILED_TO_RESOLVE_DATASET);
        assert_eq!(
            errors.errors()[1],
            "Dataset not found or not included in query: \"other\""
        );
    }

    #[test]
    fn test_resolve_field_through_aliases() {
        let mut errors = ErrorCollector::new();
        let mut js = Dataset::new("jobsearch");
        js.field_aliases.insert("country".into(), "country".into());
        let mut mobile = Dataset::new("mobile");
        mobile.field_aliases.insert("country".into(), "geo_country".into());
        let mut datasets = vec![js, mobile];
        let resolver = build(&mut datasets, &mut errors);
        let field = resolver.universal_scope().resolve("COUNTRY", &mut errors);
        assert!(!errors.has_errors(), "{:?}", errors.errors());
        assert_eq!(field.dataset_field_name("jobsearch").unwrap(), "country");
        assert_eq!(field.dataset_field_name("mobile").unwrap(), "geo_country");
        assert!(!field.is_restricted());

        let geo = resolver.universal_scope().for_scope(["jobsearch".to_string()].into_iter().collect());
        let field = geo.resolve("geo", &mut errors);
        assert_eq!(field.dataset_field_name("jobsearch").unwrap(), "country");
        assert!(field.is_restricted());
    }

    #[test]
    fn test_missing_field_yields_sentinel() {
        let mut errors = ErrorCollector::new();
        let mut datasets = vec![Dataset::new("jobsearch"), Dataset::new("mobile")];
        let resolver = build(&mut datasets, &mut errors);
        let field = resolver.universal_scope().resolve("q", &mut errors);
        assert_eq!(field.dataset_field_name("mobile").unwrap(), FAILED_TO_RESOLVE_FIELD);
        assert_eq!(errors.errors(), &["Field not found in dataset \"mobile\": \"q\"".to_string()]);
    }

    #[test]
    fn test_metric_alias_is_not_a_field() {
        let mut errors = ErrorCollector::new();
        let mut datasets = vec![Dataset::new("jobsearch")];
        let resolver = build(&mut datasets, &mut errors);
        assert_eq!(resolver.metric_alias("TOTAL"), Some("total"));
        resolver.universal_scope().resolve("total", &mut errors);
        assert_eq!(
            errors.errors()[0],
            "Metric alias cannot be used as a field: \"total\""
        );
    }

    #[test]
    fn test_field_types() {
        let mut errors = ErrorCollector::new();
        let mut datasets = vec![Dataset::new("jobsearch"), Dataset::new("mobile")];
        let resolver = build(&mut datasets, &mut errors);
        let scoped = resolver.universal_scope();
        let clicks = scoped.resolve("clicks", &mut errors);
        assert_eq!(scoped.field_type(&clicks), FieldType::Integer);
        let mixed = scoped.resolve("mixed", &mut errors);
        assert_eq!(scoped.field_type(&mixed), FieldType::Conflicted);
        assert!(!scoped.is_int_field(&mixed));
        let unknown = FieldSet::single("jobsearch", FAILED_TO_RESOLVE_FIELD);
        assert_eq!(scoped.field_type(&unknown), FieldType::String);
    }

    #[test]
    fn test_dimensions() {
        let mut errors = ErrorCollector::new();
        let mut datasets = vec![Dataset::new("jobsearch"), Dataset::new("mobile")];
        let resolver = build(&mut datasets, &mut errors);
        let scoped = resolver.universal_scope();
        assert_eq!(scoped.dimension("jobsearch", "Double_Clicks"), Some("clicks * 2"));
        assert_eq!(scoped.dimension("mobile", "double_clicks"), None);
        assert!(scoped.has_dimension("double_clicks"));
    }

    #[test]
    fn test_validation_helper_uses_scope_names() {
        let mut errors = ErrorCollector::new();
        let mut js = Dataset::new("jobsearch");
        js.alias = Some("js".into());
        let mut datasets = vec![js];
        let resolver = build(&mut datasets, &mut errors);
        let helper = resolver.validation_helper();
        assert!(helper.contains_int_field("js", "clicks"));
        assert!(!helper.contains_dataset("jobsearch"));
    }
}
