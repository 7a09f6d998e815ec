//! Execution-time algebra
//!
//! The compiled command list is run by the grouping engine. This module holds
//! the side of that protocol that stays on the query host: the small metric
//! and filter algebra evaluated over the engine's per-group sums, the group
//! key lineage, and result rendering.
//!
//! # Architecture
//!
//! ```text
//! AggregateMetric ──to_execution_metric──▶ ExecMetric
//!                                              │ requires()
//!                                              ▼
//!                      StatsSource::group_stats(QualifiedPush)
//!                                              │ register()
//!                                              ▼
//!                                   group_stats() ──▶ ResultRow ──▶ TSV / JSON
//! ```

pub mod cache_key;
pub mod filters;
pub mod group_keys;
pub mod metrics;
pub mod output;

pub use cache_key::{CacheKey, DatasetRange};
pub use filters::ExecFilter;
pub use group_keys::{GroupKey, GroupKeySet};
pub use metrics::{ExecMetric, QualifiedPush, UnaryOp};
pub use output::{format_stat, render_json, render_tsv, rows_from_group_stats, write_tsv, ResultRow};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while evaluating lowered metrics
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Unknown group stats lookup: {0}")]
    UnknownLookup(String),

    #[error("Group {0} does not exist")]
    GroupOutOfRange(usize),

    #[error("Push was not registered: {0}")]
    Unregistered(String),

    #[error("{0} can only be evaluated during term iteration")]
    IterationOnly(&'static str),

    #[error("{0} can only be evaluated over group stats")]
    GroupStatsOnly(&'static str),

    #[error("Stats source error: {0}")]
    Source(String),

    #[error("Output error: {0}")]
    Output(String),
}

impl From<csv::Error> for ExecutionError {
    fn from(err: csv::Error) -> Self {
        ExecutionError::Output(err.to_string())
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(err: std::io::Error) -> Self {
        ExecutionError::Output(err.to_string())
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        ExecutionError::Output(err.to_string())
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Named per-group values produced by earlier commands
#[derive(Debug, Clone, Default)]
pub struct NamedLookups {
    values: BTreeMap<String, Arc<Vec<f64>>>,
}

impl NamedLookups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.values.insert(name.into(), Arc::new(values));
    }

    pub fn get(&self, name: &str) -> ExecutionResult<Arc<Vec<f64>>> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownLookup(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// The grouping engine's side of the stats protocol
pub trait StatsSource {
    /// Per-group sums of one push sequence, indexed by group (0 unused)
    fn group_stats(&self, push: &QualifiedPush, num_groups: usize) -> ExecutionResult<Vec<f64>>;
}

/// Evaluate metrics over the current groups, returning one column per
/// output stat. Every push is fetched once even when several metrics need it.
pub fn evaluate_group_stats(
    metrics: &mut [ExecMetric],
    source: &dyn StatsSource,
    num_groups: usize,
) -> ExecutionResult<Vec<Vec<f64>>> {
    let mut required = BTreeSet::new();
    for metric in metrics.iter() {
        metric.collect_requires(&mut required);
    }

    let mut indexes = BTreeMap::new();
    let mut stats = Vec::with_capacity(required.len());
    for (index, push) in required.into_iter().enumerate() {
        stats.push(source.group_stats(&push, num_groups)?);
        indexes.insert(push, index);
    }
    tracing::debug!(pushes = stats.len(), num_groups, "fetched group stats");

    let mut columns = Vec::new();
    for metric in metrics.iter_mut() {
        metric.register(&indexes)?;
        match metric {
            ExecMetric::MultiPerGroupConstant { values, .. } => {
                for value in values.iter() {
                    columns.push((0..=num_groups).map(|g| value.get(g).copied().unwrap_or(0.0)).collect());
                }
            }
            other => columns.push(other.group_stats(&stats, num_groups)?),
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::MathOp;
    use std::cell::RefCell;

    struct CountingSource {
        calls: RefCell<usize>,
    }

    impl StatsSource for CountingSource {
        fn group_stats(&self, push: &QualifiedPush, num_groups: usize) -> ExecutionResult<Vec<f64>> {
            *self.calls.borrow_mut() += 1;
            let base = if push.pushes == vec!["count()".to_string()] { 2.0 } else { 10.0 };
            Ok((0..=num_groups).map(|g| base * g as f64).collect())
        }
    }

    #[test]
    fn test_evaluate_fetches_each_push_once() {
        let clicks = QualifiedPush::new("js", vec!["clicks".into()]);
        let count = QualifiedPush::new("js", vec!["count()".into()]);
        let mut metrics = vec![
            ExecMetric::document_level(clicks.clone()),
            ExecMetric::binary(
                MathOp::Divide,
                ExecMetric::document_level(clicks),
                ExecMetric::document_level(count),
            ),
            ExecMetric::MultiPerGroupConstant {
                names: vec!["v0.min".into(), "v0.max".into()],
                values: vec![Arc::new(vec![0.0, 1.0, 2.0]), Arc::new(vec![0.0, 3.0, 4.0])],
            },
        ];
        let source = CountingSource {
            calls: RefCell::new(0),
        };
        let columns = evaluate_group_stats(&mut metrics, &source, 2).unwrap();
        assert_eq!(*source.calls.borrow(), 2);
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[0][2], 20.0);
        assert_eq!(columns[1][1], 5.0);
        assert_eq!(columns[3][2], 4.0);
    }

    #[test]
    fn test_named_lookups() {
        let mut lookups = NamedLookups::new();
        lookups.insert("v0", vec![0.0, 1.0]);
        assert!(lookups.contains("v0"));
        assert_eq!(
            lookups.get("v1").unwrap_err(),
            ExecutionError::UnknownLookup("v1".to_string())
        );
    }
}
