//! Logical plan steps
//!
//! The query plan is an ordered list of [`ExecutionStep`]s. Optimisations
//! such as turning a trailing term explode into a single iteration work on
//! this level; [`ExecutionStep::commands`] then lowers each step.

use std::collections::{BTreeMap, BTreeSet};

use super::actions::Action;
use super::aggregate_filter::AggregateFilter;
use super::aggregate_metric::{traverse_filter, traverse_metric, AggregateMetric, Traversal};
use super::commands::{Command, FieldIterateOpts, NamedComputation};
use super::doc_metric::DocMetric;
use super::error::CompileResult;
use super::precomputed::Precomputed;
use crate::fields::FieldSet;
use crate::term::Term;

/// Group name used for documents falling outside every explicit group
pub const DEFAULT_GROUP_NAME: &str = "DEFAULT";

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStep {
    ComputePrecomputed {
        scope: BTreeSet<String>,
        computation: Precomputed,
        name: String,
    },
    ComputeManyPrecomputed {
        scope: BTreeSet<String>,
        computations: Vec<(Precomputed, String)>,
    },
    ExplodeAndRegroup {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        limit: Option<u64>,
        metric: Option<AggregateMetric>,
        with_default: bool,
    },
    ExplodeFieldIn {
        field: FieldSet,
        int_terms: Vec<i64>,
        string_terms: Vec<String>,
        is_int_field: bool,
        with_default: bool,
    },
    ExplodeMetric {
        per_dataset_metric: BTreeMap<String, DocMetric>,
        min: i64,
        max: i64,
        interval: i64,
        scope: BTreeSet<String>,
        exclude_gutters: bool,
        with_default: bool,
        from_predicate: bool,
    },
    ExplodeTimePeriod {
        period_millis: i64,
        time_field: Option<FieldSet>,
        time_format: Option<String>,
        is_relative: bool,
    },
    ExplodeTimeBuckets {
        num_buckets: u32,
        time_field: Option<FieldSet>,
        time_format: Option<String>,
    },
    ExplodeDayOfWeek,
    ExplodeMonthOfYear {
        time_field: Option<FieldSet>,
        time_format: Option<String>,
    },
    ExplodeSessionNames,
    ExplodePerDocPercentile {
        field: FieldSet,
        num_buckets: u32,
    },
    ExplodeRandom {
        field: FieldSet,
        k: u32,
        salt: String,
    },
    ExplodeRandomMetric {
        per_dataset_metric: BTreeMap<String, DocMetric>,
        scope: BTreeSet<String>,
        k: u32,
        salt: String,
    },
    /// Term iteration that emits stats directly
    IterateStats {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        limit: Option<u64>,
        query_limit: Option<u64>,
        metric: Option<AggregateMetric>,
        string_term_subset: Option<BTreeSet<String>>,
        int_term_subset: Option<BTreeSet<i64>>,
        stats: Vec<AggregateMetric>,
        format_strings: Vec<Option<String>>,
    },
    GetGroupStats {
        stats: Vec<AggregateMetric>,
        format_strings: Vec<Option<String>>,
    },
    FilterActions(Vec<Action>),
    FilterGroups(AggregateFilter),
}

fn per_dataset_pushes(
    per_dataset_metric: &BTreeMap<String, DocMetric>,
) -> CompileResult<BTreeMap<String, Vec<String>>> {
    per_dataset_metric
        .iter()
        .map(|(dataset, metric)| Ok((dataset.clone(), metric.get_pushes(dataset)?)))
        .collect()
}

impl ExecutionStep {
    pub fn commands(&self) -> CompileResult<Vec<Command>> {
        let command = match self {
            ExecutionStep::ComputePrecomputed {
                scope,
                computation,
                name,
            } => {
                let precomputation = computation.commands(scope)?;
                let mut commands = precomputation.before;
                commands.push(Command::ComputeAndCreateGroupStatsLookup {
                    computation: Box::new(precomputation.computation),
                    name: name.clone(),
                });
                commands.extend(precomputation.after);
                return Ok(commands);
            }
            ExecutionStep::ComputeManyPrecomputed { scope, computations } => {
                let mut named = Vec::with_capacity(computations.len());
                for (computation, name) in computations {
                    let precomputation = computation.commands(scope)?;
                    if precomputation.has_context() {
                        return self.naive_commands();
                    }
                    named.push(NamedComputation {
                        computation: precomputation.computation,
                        name: name.clone(),
                    });
                }
                Command::ComputeAndCreateGroupStatsLookups { computations: named }
            }
            ExecutionStep::ExplodeAndRegroup {
                field,
                filter,
                limit,
                metric,
                with_default,
            } => Command::IterateAndExplode {
                field: field.clone(),
                opts: FieldIterateOpts::new(filter.clone(), *limit, metric.clone()),
                default_name: with_default.then(|| DEFAULT_GROUP_NAME.to_string()),
            },
            ExecutionStep::ExplodeFieldIn {
                field,
                int_terms,
                string_terms,
                is_int_field,
                with_default,
            } => Command::ExplodeGroups {
                field: field.clone(),
                int_terms: is_int_field.then(|| int_terms.clone()),
                string_terms: (!is_int_field).then(|| string_terms.clone()),
                default_group_term: with_default.then(|| DEFAULT_GROUP_NAME.to_string()),
            },
            ExecutionStep::ExplodeMetric {
                per_dataset_metric,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
                from_predicate,
                ..
            } => Command::MetricRegroup {
                per_dataset_pushes: per_dataset_pushes(per_dataset_metric)?,
                min: *min,
                max: *max,
                interval: *interval,
                exclude_gutters: *exclude_gutters,
                with_default: *with_default,
                from_predicate: *from_predicate,
            },
            ExecutionStep::ExplodeTimePeriod {
                period_millis,
                time_field,
                time_format,
                is_relative,
            } => Command::TimeRegroup {
                period_millis: *period_millis,
                time_field: time_field.clone(),
                time_format: time_format.clone(),
                is_relative: *is_relative,
            },
            ExecutionStep::ExplodeTimeBuckets {
                num_buckets,
                time_field,
                time_format,
            } => Command::ExplodeTimeBuckets {
                num_buckets: *num_buckets,
                time_field: time_field.clone(),
                time_format: time_format.clone(),
            },
            ExecutionStep::ExplodeDayOfWeek => Command::ExplodeDayOfWeek,
            ExecutionStep::ExplodeMonthOfYear {
                time_field,
                time_format,
            } => Command::ExplodeMonthOfYear {
                time_field: time_field.clone(),
                time_format: time_format.clone(),
            },
            ExecutionStep::ExplodeSessionNames => Command::ExplodeSessionNames,
            ExecutionStep::ExplodePerDocPercentile { field, num_buckets } => Command::ExplodePerDocPercentile {
                field: field.clone(),
                num_buckets: *num_buckets,
            },
            ExecutionStep::ExplodeRandom { field, k, salt } => Command::ExplodeRandom {
                field: field.clone(),
                k: *k,
                salt: salt.clone(),
            },
            ExecutionStep::ExplodeRandomMetric {
                per_dataset_metric,
                k,
                salt,
                ..
            } => Command::RandomMetricRegroup {
                per_dataset_pushes: per_dataset_pushes(per_dataset_metric)?,
                k: *k,
                salt: salt.clone(),
            },
            ExecutionStep::IterateStats {
                field,
                filter,
                limit,
                query_limit,
                metric,
                string_term_subset,
                int_term_subset,
                stats,
                format_strings,
            } => {
                let mut opts = FieldIterateOpts::new(filter.clone(), *limit, metric.clone());
                opts.limit = *query_limit;
                opts.int_term_subset = int_term_subset.clone();
                opts.string_term_subset = string_term_subset.clone();
                Command::SimpleIterate {
                    field: field.clone(),
                    opts,
                    selecting: stats.clone(),
                    format_strings: format_strings.clone(),
                }
            }
            ExecutionStep::GetGroupStats { stats, format_strings } => Command::GetGroupStats {
                metrics: stats.clone(),
                format_strings: format_strings.clone(),
                return_group_keys: true,
            },
            ExecutionStep::FilterActions(actions) => Command::ApplyFilterActions {
                actions: actions.clone(),
            },
            ExecutionStep::FilterGroups(filter) => Command::ApplyGroupFilter { filter: filter.clone() },
        };
        Ok(vec![command])
    }

    /// One lookup command sequence per computation
    fn naive_commands(&self) -> CompileResult<Vec<Command>> {
        let mut commands = Vec::new();
        if let ExecutionStep::ComputeManyPrecomputed { scope, computations } = self {
            for (computation, name) in computations {
                let single = ExecutionStep::ComputePrecomputed {
                    scope: scope.clone(),
                    computation: computation.clone(),
                    name: name.clone(),
                };
                commands.extend(single.commands()?);
            }
        }
        Ok(commands)
    }

    pub fn traverse1(self, f: &mut Traversal<'_>) -> CompileResult<ExecutionStep> {
        Ok(match self {
            ExecutionStep::ComputePrecomputed {
                scope,
                computation,
                name,
            } => ExecutionStep::ComputePrecomputed {
                scope,
                computation: computation.traverse1(f)?,
                name,
            },
            ExecutionStep::ComputeManyPrecomputed { scope, computations } => ExecutionStep::ComputeManyPrecomputed {
                scope,
                computations: computations
                    .into_iter()
                    .map(|(c, name)| Ok((c.traverse1(f)?, name)))
                    .collect::<CompileResult<_>>()?,
            },
            ExecutionStep::ExplodeAndRegroup {
                field,
                filter: x,
                limit,
                metric: m,
                with_default,
            } => ExecutionStep::ExplodeAndRegroup {
                field,
                filter: traverse_filter(x, f)?,
                limit,
                metric: traverse_metric(m, f)?,
                with_default,
            },
            ExecutionStep::IterateStats {
                field,
                filter: x,
                limit,
                query_limit,
                metric: m,
                string_term_subset,
                int_term_subset,
                stats,
                format_strings,
            } => ExecutionStep::IterateStats {
                field,
                filter: traverse_filter(x, f)?,
                limit,
                query_limit,
                metric: traverse_metric(m, f)?,
                string_term_subset,
                int_term_subset,
                stats: stats.into_iter().map(&mut *f).collect::<CompileResult<_>>()?,
                format_strings,
            },
            ExecutionStep::GetGroupStats { stats, format_strings } => ExecutionStep::GetGroupStats {
                stats: stats.into_iter().map(&mut *f).collect::<CompileResult<_>>()?,
                format_strings,
            },
            ExecutionStep::FilterGroups(x) => ExecutionStep::FilterGroups(x.traverse1(f)?),
            other => other,
        })
    }

    /// Terms of an explicit term list as a term filter
    pub fn terms_as_filter(&self) -> Option<AggregateFilter> {
        match self {
            ExecutionStep::ExplodeFieldIn {
                int_terms,
                string_terms,
                is_int_field,
                ..
            } => Some(if *is_int_field {
                AggregateFilter::or(int_terms.iter().map(|t| AggregateFilter::TermIs(Term::int(*t))).collect())
            } else {
                AggregateFilter::or(
                    string_terms
                        .iter()
                        .map(|t| AggregateFilter::TermIs(Term::string(t.clone())))
                        .collect(),
                )
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{CompareOp, GroupBy};

    fn scope() -> BTreeSet<String> {
        ["js".to_string()].into_iter().collect()
    }

    fn distinct(name: &str) -> (Precomputed, String) {
        (
            Precomputed::Distinct {
                field: FieldSet::single("js", "country"),
                filter: None,
                window: None,
            },
            name.to_string(),
        )
    }

    #[test]
    fn test_explode_and_regroup_default_name() {
        let step = ExecutionStep::ExplodeAndRegroup {
            field: FieldSet::single("js", "country"),
            filter: None,
            limit: Some(10),
            metric: None,
            with_default: true,
        };
        match &step.commands().unwrap()[0] {
            Command::IterateAndExplode { opts, default_name, .. } => {
                assert_eq!(default_name.as_deref(), Some("DEFAULT"));
                assert_eq!(opts.top_k.as_ref().and_then(|t| t.limit), Some(10));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_many_precomputed_merges_without_context() {
        let step = ExecutionStep::ComputeManyPrecomputed {
            scope: scope(),
            computations: vec![distinct("v0"), distinct("v1")],
        };
        let commands = step.commands().unwrap();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            &commands[0],
            Command::ComputeAndCreateGroupStatsLookups { computations } if computations.len() == 2
        ));
    }

    #[test]
    fn test_many_precomputed_falls_back_with_context() {
        let step = ExecutionStep::ComputeManyPrecomputed {
            scope: scope(),
            computations: vec![
                distinct("v0"),
                (
                    Precomputed::SumAcrossGroupBy {
                        group_by: GroupBy::DayOfWeek,
                        metric: AggregateMetric::Constant(1.0),
                    },
                    "v1".to_string(),
                ),
            ],
        };
        let commands = step.commands().unwrap();
        let names: Vec<&str> = commands.iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec![
                "computeAndCreateGroupStatsLookup",
                "explodeDayOfWeek",
                "computeAndCreateGroupStatsLookup",
                "regroupIntoParent"
            ]
        );
    }

    #[test]
    fn test_field_in_terms_filter() {
        let step = ExecutionStep::ExplodeFieldIn {
            field: FieldSet::single("js", "country"),
            int_terms: vec![],
            string_terms: vec!["us".into(), "gb".into()],
            is_int_field: false,
            with_default: false,
        };
        assert_eq!(
            step.terms_as_filter(),
            Some(AggregateFilter::Or(vec![
                AggregateFilter::TermIs(Term::string("us")),
                AggregateFilter::TermIs(Term::string("gb")),
            ]))
        );
        match &step.commands().unwrap()[0] {
            Command::ExplodeGroups {
                int_terms,
                string_terms,
                default_group_term,
                ..
            } => {
                assert!(int_terms.is_none());
                assert_eq!(string_terms.as_ref().map(|t| t.len()), Some(2));
                assert!(default_group_term.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_traverse1_rewrites_group_filter() {
        let step = ExecutionStep::FilterGroups(AggregateFilter::compare(
            CompareOp::Gt,
            AggregateMetric::Constant(1.0),
            AggregateMetric::Constant(0.0),
        ));
        let rewritten = step.traverse1(&mut |_| Ok(AggregateMetric::Constant(5.0))).unwrap();
        assert_eq!(
            rewritten,
            ExecutionStep::FilterGroups(AggregateFilter::compare(
                CompareOp::Gt,
                AggregateMetric::Constant(5.0),
                AggregateMetric::Constant(5.0),
            ))
        );
    }
}
