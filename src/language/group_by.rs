//! Grouping stages
//!
//! Each [`GroupBy`] splits every current group into child groups. Stages are
//! lowered one by one into [`ExecutionStep`]s.

use std::collections::{BTreeMap, BTreeSet};

use super::aggregate_filter::AggregateFilter;
use super::aggregate_metric::{AggregateMetric, Rewrite, Traversal};
use super::doc_filter::DocFilter;
use super::doc_metric::DocMetric;
use super::error::{CompileError, CompileResult};
use super::execution_step::ExecutionStep;
use crate::fields::FieldSet;

#[derive(Debug, Clone, PartialEq)]
pub enum GroupBy {
    /// Fixed-width buckets of a doc metric, `[min, max)` in steps of `interval`
    Metric {
        metric: DocMetric,
        min: i64,
        max: i64,
        interval: i64,
        exclude_gutters: bool,
        with_default: bool,
    },
    Time {
        period_millis: i64,
        field: Option<FieldSet>,
        format: Option<String>,
        relative: bool,
    },
    TimeBuckets {
        num_buckets: u32,
        field: Option<FieldSet>,
        format: Option<String>,
    },
    Month {
        field: Option<FieldSet>,
        format: Option<String>,
    },
    /// Explicit term list; int terms when no string terms are given
    FieldIn {
        field: FieldSet,
        int_terms: Vec<i64>,
        string_terms: Vec<String>,
        with_default: bool,
    },
    /// One group per term, optionally filtered and limited to the top terms
    Field {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        limit: Option<u64>,
        metric: Option<AggregateMetric>,
        with_default: bool,
    },
    DayOfWeek,
    SessionName,
    Quantiles {
        field: FieldSet,
        num_buckets: u32,
    },
    /// Two groups: documents matching the filter and the rest
    Predicate {
        filter: DocFilter,
    },
    Random {
        field: FieldSet,
        is_int_field: bool,
        k: u32,
        salt: String,
    },
    RandomMetric {
        metric: DocMetric,
        k: u32,
        salt: String,
    },
}

impl GroupBy {
    /// Term group-by; a limit without an ordering metric orders by count
    pub fn field(
        field: FieldSet,
        filter: Option<AggregateFilter>,
        limit: Option<u64>,
        metric: Option<AggregateMetric>,
        with_default: bool,
    ) -> GroupBy {
        let metric = match (limit, metric) {
            (Some(_), None) => Some(AggregateMetric::DocStats(DocMetric::Count)),
            (_, metric) => metric,
        };
        GroupBy::Field {
            field,
            filter,
            limit,
            metric,
            with_default,
        }
    }

    pub fn transform(self, r: &Rewrite<'_>) -> GroupBy {
        let rebuilt = match self {
            GroupBy::Metric {
                metric,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
            } => GroupBy::Metric {
                metric: metric.transform(r.doc_metric, r.doc_filter),
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
            },
            GroupBy::Field {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => GroupBy::Field {
                field,
                filter: filter.map(|f| f.transform(r)),
                limit,
                metric: metric.map(|m| m.transform(r)),
                with_default,
            },
            GroupBy::Predicate { filter } => GroupBy::Predicate {
                filter: filter.transform(r.doc_metric, r.doc_filter),
            },
            GroupBy::RandomMetric { metric, k, salt } => GroupBy::RandomMetric {
                metric: metric.transform(r.doc_metric, r.doc_filter),
                k,
                salt,
            },
            other => other,
        };
        (r.group_by)(rebuilt)
    }

    pub fn traverse1(self, f: &mut Traversal<'_>) -> CompileResult<GroupBy> {
        Ok(match self {
            GroupBy::Field {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => GroupBy::Field {
                field,
                filter: match filter {
                    Some(filter) => Some(filter.traverse1(f)?),
                    None => None,
                },
                limit,
                metric: match metric {
                    Some(metric) => Some(f(metric)?),
                    None => None,
                },
                with_default,
            },
            other => other,
        })
    }

    /// Whether every document of a parent group lands in some child group
    pub fn is_total(&self) -> bool {
        match self {
            GroupBy::Metric {
                exclude_gutters,
                with_default,
                ..
            } => *with_default || !*exclude_gutters,
            GroupBy::FieldIn { with_default, .. } => *with_default,
            GroupBy::Field {
                filter,
                limit,
                with_default,
                ..
            } => *with_default || (filter.is_none() && limit.is_none()),
            GroupBy::Time { .. }
            | GroupBy::TimeBuckets { .. }
            | GroupBy::Month { .. }
            | GroupBy::DayOfWeek
            | GroupBy::SessionName
            | GroupBy::Quantiles { .. }
            | GroupBy::Predicate { .. }
            | GroupBy::Random { .. }
            | GroupBy::RandomMetric { .. } => true,
        }
    }

    /// Equivalent grouping that keeps every document
    pub fn make_total(self) -> CompileResult<GroupBy> {
        if self.is_total() {
            return Ok(self);
        }
        match self {
            GroupBy::Metric {
                metric,
                min,
                max,
                interval,
                ..
            } => Ok(GroupBy::Metric {
                metric,
                min,
                max,
                interval,
                exclude_gutters: true,
                with_default: true,
            }),
            GroupBy::FieldIn {
                field,
                int_terms,
                string_terms,
                ..
            } => Ok(GroupBy::FieldIn {
                field,
                int_terms,
                string_terms,
                with_default: true,
            }),
            GroupBy::Field {
                field,
                filter,
                limit,
                metric,
                ..
            } => Ok(GroupBy::Field {
                field,
                filter,
                limit,
                metric,
                with_default: true,
            }),
            other => Err(CompileError::Unsupported(format!("Cannot make group by total: {:?}", other))),
        }
    }

    /// Whether the grouping iterates a field's terms in the engine
    pub fn requires_ftgs(&self) -> bool {
        match self {
            GroupBy::Field { filter, metric, .. } => {
                filter.as_ref().map(|f| f.requires_ftgs()).unwrap_or(false)
                    || metric.as_ref().map(|m| m.requires_ftgs()).unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn execution_step(&self, scope: &BTreeSet<String>) -> CompileResult<ExecutionStep> {
        Ok(match self {
            GroupBy::Metric {
                metric,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
            } => ExecutionStep::ExplodeMetric {
                per_dataset_metric: scope.iter().map(|d| (d.clone(), metric.clone())).collect(),
                min: *min,
                max: *max,
                interval: *interval,
                scope: scope.clone(),
                exclude_gutters: *exclude_gutters,
                with_default: *with_default,
                from_predicate: false,
            },
            GroupBy::Time {
                period_millis,
                field,
                format,
                relative,
            } => ExecutionStep::ExplodeTimePeriod {
                period_millis: *period_millis,
                time_field: field.clone(),
                time_format: format.clone(),
                is_relative: *relative,
            },
            GroupBy::TimeBuckets {
                num_buckets,
                field,
                format,
            } => ExecutionStep::ExplodeTimeBuckets {
                num_buckets: *num_buckets,
                time_field: field.clone(),
                time_format: format.clone(),
            },
            GroupBy::Month { field, format } => ExecutionStep::ExplodeMonthOfYear {
                time_field: field.clone(),
                time_format: format.clone(),
            },
            GroupBy::FieldIn {
                field,
                int_terms,
                string_terms,
                with_default,
            } => ExecutionStep::ExplodeFieldIn {
                field: field.clone(),
                is_int_field: string_terms.is_empty(),
                int_terms: int_terms.clone(),
                string_terms: string_terms.clone(),
                with_default: *with_default,
            },
            GroupBy::Field {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => ExecutionStep::ExplodeAndRegroup {
                field: field.clone(),
                filter: filter.clone(),
                limit: *limit,
                metric: metric.clone(),
                with_default: *with_default,
            },
            GroupBy::DayOfWeek => ExecutionStep::ExplodeDayOfWeek,
            GroupBy::SessionName => ExecutionStep::ExplodeSessionNames,
            GroupBy::Quantiles { field, num_buckets } => ExecutionStep::ExplodePerDocPercentile {
                field: field.clone(),
                num_buckets: *num_buckets,
            },
            GroupBy::Predicate { filter } => {
                let mut per_dataset_metric = BTreeMap::new();
                for dataset in scope {
                    per_dataset_metric.insert(dataset.clone(), filter.as_zero_one_metric(dataset)?);
                }
                ExecutionStep::ExplodeMetric {
                    per_dataset_metric,
                    min: 0,
                    max: 2,
                    interval: 1,
                    scope: scope.clone(),
                    exclude_gutters: true,
                    with_default: false,
                    from_predicate: true,
                }
            }
            GroupBy::Random { field, k, salt, .. } => ExecutionStep::ExplodeRandom {
                field: field.clone(),
                k: *k,
                salt: salt.clone(),
            },
            GroupBy::RandomMetric { metric, k, salt } => ExecutionStep::ExplodeRandomMetric {
                per_dataset_metric: scope.iter().map(|d| (d.clone(), metric.clone())).collect(),
                scope: scope.clone(),
                k: *k,
                salt: salt.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> BTreeSet<String> {
        ["js".to_string()].into_iter().collect()
    }

    fn country() -> FieldSet {
        FieldSet::single("js", "country")
    }

    #[test]
    fn test_limit_defaults_to_count_ordering() {
        match GroupBy::field(country(), None, Some(5), None, false) {
            GroupBy::Field { metric, .. } => {
                assert_eq!(metric, Some(AggregateMetric::DocStats(DocMetric::Count)))
            }
            other => panic!("unexpected {:?}", other),
        }
        match GroupBy::field(country(), None, None, None, false) {
            GroupBy::Field { metric, .. } => assert_eq!(metric, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_is_total() {
        assert!(GroupBy::field(country(), None, None, None, false).is_total());
        assert!(!GroupBy::field(country(), None, Some(3), None, false).is_total());
        let bucket = GroupBy::Metric {
            metric: DocMetric::Count,
            min: 0,
            max: 10,
            interval: 1,
            exclude_gutters: true,
            with_default: false,
        };
        assert!(!bucket.is_total());
        let total = bucket.make_total().unwrap();
        assert!(total.is_total());
        assert!(matches!(
            total,
            GroupBy::Metric {
                exclude_gutters: true,
                with_default: true,
                ..
            }
        ));
        assert!(GroupBy::DayOfWeek.is_total());
    }

    #[test]
    fn test_predicate_lowers_to_zero_one_buckets() {
        let group_by = GroupBy::Predicate {
            filter: DocFilter::Always,
        };
        match group_by.execution_step(&scope()).unwrap() {
            ExecutionStep::ExplodeMetric {
                per_dataset_metric,
                min,
                max,
                interval,
                exclude_gutters,
                from_predicate,
                ..
            } => {
                assert_eq!(per_dataset_metric["js"], DocMetric::Constant(1));
                assert_eq!((min, max, interval), (0, 2, 1));
                assert!(exclude_gutters);
                assert!(from_predicate);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_traverse1_reaches_top_k_metric() {
        let group_by = GroupBy::field(country(), None, Some(3), None, false);
        let rewritten = group_by
            .traverse1(&mut |_| Ok(AggregateMetric::GroupStatsLookup("v0".into())))
            .unwrap();
        match rewritten {
            GroupBy::Field { metric, .. } => {
                assert_eq!(metric, Some(AggregateMetric::GroupStatsLookup("v0".into())))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
