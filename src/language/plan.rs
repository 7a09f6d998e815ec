//! Logical plan of one query
//!
//! A [`Query`] is what the front end produces and what every pass rewrites:
//! the datasets it reads, the document filter, the grouping stages and the
//! selected metrics.

use chrono::{DateTime, FixedOffset};
use std::collections::{BTreeMap, BTreeSet};

use super::aggregate_filter::AggregateFilter;
use super::aggregate_metric::{AggregateMetric, Rewrite, Traversal};
use super::doc_filter::DocFilter;
use super::error::{CompileError, CompileResult};
use super::group_by::GroupBy;
use crate::execution::DatasetRange;

/// Dataset reference in `FROM`
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub dataset: String,
    pub alias: Option<String>,
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
    /// alias -> physical field
    pub field_aliases: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            alias: None,
            start: None,
            end: None,
            field_aliases: BTreeMap::new(),
        }
    }

    /// Name the rest of the query uses for this dataset
    pub fn scope_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.dataset)
    }

    pub fn range(&self) -> DatasetRange {
        DatasetRange {
            name: self.dataset.clone(),
            start: self.start.map(|t| t.to_rfc3339()),
            end: self.end.map(|t| t.to_rfc3339()),
            field_aliases: self.field_aliases.clone(),
        }
    }
}

/// One `GROUP BY` stage with its optional `HAVING` filter
#[derive(Debug, Clone, PartialEq)]
pub struct GroupByEntry {
    pub group_by: GroupBy,
    pub filter: Option<AggregateFilter>,
    pub alias: Option<String>,
}

impl GroupByEntry {
    pub fn new(group_by: GroupBy) -> Self {
        Self {
            group_by,
            filter: None,
            alias: None,
        }
    }

    pub fn transform(self, r: &Rewrite<'_>) -> GroupByEntry {
        GroupByEntry {
            group_by: self.group_by.transform(r),
            filter: self.filter.map(|f| f.transform(r)),
            alias: self.alias,
        }
    }

    pub fn traverse1(self, f: &mut Traversal<'_>) -> CompileResult<GroupByEntry> {
        Ok(GroupByEntry {
            group_by: self.group_by.traverse1(f)?,
            filter: match self.filter {
                Some(filter) => Some(filter.traverse1(f)?),
                None => None,
            },
            alias: self.alias,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub datasets: Vec<Dataset>,
    pub filter: Option<DocFilter>,
    pub group_bys: Vec<GroupByEntry>,
    pub selects: Vec<AggregateMetric>,
    pub format_strings: Vec<Option<String>>,
    pub options: Vec<String>,
    pub row_limit: Option<u64>,
}

impl Query {
    pub fn new(datasets: Vec<Dataset>) -> Self {
        Self {
            datasets,
            filter: None,
            group_bys: Vec::new(),
            selects: Vec::new(),
            format_strings: Vec::new(),
            options: Vec::new(),
            row_limit: None,
        }
    }

    /// Scope names of every dataset in the query
    pub fn scope(&self) -> BTreeSet<String> {
        self.datasets.iter().map(|d| d.scope_name().to_string()).collect()
    }

    /// Scope name -> physical dataset name; scope names must be unique
    pub fn name_to_index(&self) -> CompileResult<BTreeMap<String, String>> {
        let mut names = BTreeMap::new();
        for dataset in &self.datasets {
            let name = dataset.scope_name().to_string();
            if names.insert(name.clone(), dataset.dataset.clone()).is_some() {
                return Err(CompileError::Invalid(format!("Duplicate name encountered: {}", name)));
            }
        }
        Ok(names)
    }

    pub fn transform(self, r: &Rewrite<'_>) -> Query {
        Query {
            filter: self.filter.map(|f| f.transform(r.doc_metric, r.doc_filter)),
            group_bys: self.group_bys.into_iter().map(|g| g.transform(r)).collect(),
            selects: self.selects.into_iter().map(|m| m.transform(r)).collect(),
            ..self
        }
    }

    pub fn traverse1(self, f: &mut Traversal<'_>) -> CompileResult<Query> {
        let mut group_bys = Vec::with_capacity(self.group_bys.len());
        for entry in self.group_bys {
            group_bys.push(entry.traverse1(f)?);
        }
        let mut selects = Vec::with_capacity(self.selects.len());
        for select in self.selects {
            selects.push(f(select)?);
        }
        Ok(Query {
            group_bys,
            selects,
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::DocMetric;

    #[test]
    fn test_scope_uses_aliases() {
        let mut aliased = Dataset::new("jobsearch");
        aliased.alias = Some("js".into());
        let query = Query::new(vec![aliased, Dataset::new("mobsearch")]);
        let scope: Vec<_> = query.scope().into_iter().collect();
        assert_eq!(scope, vec!["js", "mobsearch"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let query = Query::new(vec![Dataset::new("a"), Dataset::new("a")]);
        assert!(matches!(query.name_to_index(), Err(CompileError::Invalid(_))));
    }

    #[test]
    fn test_traverse1_visits_selects_and_top_k() {
        let mut query = Query::new(vec![Dataset::new("a")]);
        query.selects.push(AggregateMetric::DocStats(DocMetric::Count));
        query.group_bys.push(GroupByEntry::new(GroupBy::field(
            crate::fields::FieldSet::single("a", "country"),
            None,
            Some(10),
            None,
            false,
        )));
        let mut seen = 0;
        let query = query
            .traverse1(&mut |m| {
                seen += 1;
                Ok(m)
            })
            .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(query.selects.len(), 1);
    }
}
