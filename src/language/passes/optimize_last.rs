//! Step-level optimisations run after the steps are laid out
//!
//! - A trailing term explosion whose groups are only read once becomes a
//!   single [`ExecutionStep::IterateStats`], which streams the stats during
//!   term iteration instead of materialising the groups.
//! - Runs of [`ExecutionStep::ComputePrecomputed`] over the same scope that do
//!   not read each other's lookups merge into one
//!   [`ExecutionStep::ComputeManyPrecomputed`].

use std::cell::RefCell;
use std::collections::BTreeSet;

use crate::language::execution_step::ExecutionStep;
use crate::language::precomputed::Precomputed;
use crate::language::{AggregateMetric, Rewrite};

pub fn optimize_last(steps: Vec<ExecutionStep>, query_limit: Option<u64>) -> Vec<ExecutionStep> {
    let steps = iterate_last(steps, query_limit);
    group_precomputed(steps)
}

fn iterate_last(mut steps: Vec<ExecutionStep>, query_limit: Option<u64>) -> Vec<ExecutionStep> {
    match steps.as_slice() {
        [.., ExecutionStep::ExplodeAndRegroup { with_default: false, .. }] => {
            if let Some(ExecutionStep::ExplodeAndRegroup {
                field,
                filter,
                limit,
                metric,
                ..
            }) = steps.pop()
            {
                steps.push(ExecutionStep::IterateStats {
                    field,
                    filter,
                    limit,
                    query_limit,
                    metric,
                    string_term_subset: None,
                    int_term_subset: None,
                    stats: Vec::new(),
                    format_strings: Vec::new(),
                });
            }
            steps
        }
        [.., ExecutionStep::ExplodeAndRegroup { with_default: false, .. }, ExecutionStep::GetGroupStats { stats, .. }]
            if !stats.iter().any(AggregateMetric::is_ordered) =>
        {
            let last = steps.pop();
            let explode = steps.pop();
            if let (
                Some(ExecutionStep::GetGroupStats { stats, format_strings }),
                Some(ExecutionStep::ExplodeAndRegroup {
                    field,
                    filter,
                    limit,
                    metric,
                    ..
                }),
            ) = (last, explode)
            {
                steps.push(ExecutionStep::IterateStats {
                    field,
                    filter,
                    limit,
                    query_limit,
                    metric,
                    string_term_subset: None,
                    int_term_subset: None,
                    stats: fix_for_iteration(stats),
                    format_strings,
                });
            }
            steps
        }
        [.., ExecutionStep::ExplodeFieldIn { with_default: false, .. }, ExecutionStep::GetGroupStats { .. }] => {
            let last = steps.pop();
            let explode = steps.pop();
            if let (
                Some(ExecutionStep::GetGroupStats { stats, format_strings }),
                Some(ExecutionStep::ExplodeFieldIn {
                    field,
                    int_terms,
                    string_terms,
                    ..
                }),
            ) = (last, explode)
            {
                steps.push(ExecutionStep::IterateStats {
                    field,
                    filter: None,
                    limit: None,
                    query_limit,
                    metric: None,
                    string_term_subset: (!string_terms.is_empty()).then(|| string_terms.into_iter().collect()),
                    int_term_subset: (!int_terms.is_empty()).then(|| int_terms.into_iter().collect()),
                    stats: fix_for_iteration(stats),
                    format_strings,
                });
            }
            steps
        }
        _ => steps,
    }
}

/// During term iteration groups are visited one term at a time, so lags read
/// the previous terms and running sums start one step earlier.
fn fix_for_iteration(stats: Vec<AggregateMetric>) -> Vec<AggregateMetric> {
    let fix = |metric: AggregateMetric| match metric {
        AggregateMetric::Running { offset, metric } => AggregateMetric::Running {
            offset: offset.saturating_sub(1),
            metric,
        },
        AggregateMetric::Lag { lag, metric } => AggregateMetric::IterateLag { lag, metric },
        other => other,
    };
    stats
        .into_iter()
        .map(|stat| stat.transform(&Rewrite::aggregate_metrics(&fix)))
        .collect()
}

fn group_precomputed(steps: Vec<ExecutionStep>) -> Vec<ExecutionStep> {
    let mut result = Vec::with_capacity(steps.len());
    let mut run: Vec<(BTreeSet<String>, Vec<(Precomputed, String)>)> = Vec::new();
    for step in steps {
        match step {
            ExecutionStep::ComputePrecomputed {
                scope,
                computation,
                name,
            } => {
                let depends_on_run = run.last().map_or(false, |(run_scope, members)| {
                    let needed = named_dependencies(&computation);
                    *run_scope != scope
                        || members
                            .iter()
                            .any(|(p, n)| p.output_names(n).iter().any(|o| needed.contains(o)))
                });
                match run.last_mut() {
                    Some((_, members)) if !depends_on_run => members.push((computation, name)),
                    _ => run.push((scope, vec![(computation, name)])),
                }
            }
            other => {
                flush(&mut run, &mut result);
                result.push(other);
            }
        }
    }
    flush(&mut run, &mut result);
    result
}

fn flush(run: &mut Vec<(BTreeSet<String>, Vec<(Precomputed, String)>)>, result: &mut Vec<ExecutionStep>) {
    for (scope, mut computations) in run.drain(..) {
        if computations.len() == 1 {
            if let Some((computation, name)) = computations.pop() {
                result.push(ExecutionStep::ComputePrecomputed {
                    scope,
                    computation,
                    name,
                });
            }
        } else {
            result.push(ExecutionStep::ComputeManyPrecomputed { scope, computations });
        }
    }
}

/// Lookup names read by a computation
fn named_dependencies(precomputed: &Precomputed) -> BTreeSet<String> {
    let names = RefCell::new(BTreeSet::new());
    let visit = |m: AggregateMetric| {
        match &m {
            AggregateMetric::GroupStatsLookup(name) => {
                names.borrow_mut().insert(name.clone());
            }
            AggregateMetric::GroupStatsMultiLookup(many) => names.borrow_mut().extend(many.iter().cloned()),
            _ => {}
        }
        m
    };
    precomputed.clone().transform(&Rewrite::aggregate_metrics(&visit));
    names.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldSet;
    use crate::language::DocMetric;

    fn country() -> FieldSet {
        FieldSet::single("js", "country")
    }

    fn scope() -> BTreeSet<String> {
        ["js".to_string()].into_iter().collect()
    }

    fn explode(with_default: bool) -> ExecutionStep {
        ExecutionStep::ExplodeAndRegroup {
            field: country(),
            filter: None,
            limit: Some(5),
            metric: Some(AggregateMetric::DocStats(DocMetric::Count)),
            with_default,
        }
    }

    fn stats(metric: AggregateMetric) -> ExecutionStep {
        ExecutionStep::GetGroupStats {
            stats: vec![metric],
            format_strings: vec![None],
        }
    }

    fn distinct(name: &str) -> ExecutionStep {
        ExecutionStep::ComputePrecomputed {
            scope: scope(),
            computation: Precomputed::Distinct {
                field: country(),
                filter: None,
                window: None,
            },
            name: name.into(),
        }
    }

    #[test]
    fn test_explode_and_stats_become_iterate() {
        let steps = optimize_last(vec![explode(false), stats(AggregateMetric::Constant(1.0))], Some(100));
        assert_eq!(steps.len(), 1);
        match &steps[0] {
            ExecutionStep::IterateStats {
                limit,
                query_limit,
                stats,
                ..
            } => {
                assert_eq!(*limit, Some(5));
                assert_eq!(*query_limit, Some(100));
                assert_eq!(stats.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_default_group_prevents_iterate() {
        let steps = vec![explode(true), stats(AggregateMetric::Constant(1.0))];
        assert_eq!(optimize_last(steps.clone(), None), steps);
    }

    #[test]
    fn test_ordered_stats_prevent_iterate() {
        let window = AggregateMetric::Window {
            window: 2,
            metric: Box::new(AggregateMetric::Constant(1.0)),
        };
        let steps = vec![explode(false), stats(window)];
        assert_eq!(optimize_last(steps.clone(), None), steps);
    }

    #[test]
    fn test_field_in_becomes_term_subset() {
        let steps = vec![
            ExecutionStep::ExplodeFieldIn {
                field: country(),
                int_terms: Vec::new(),
                string_terms: vec!["us".into(), "gb".into()],
                is_int_field: false,
                with_default: false,
            },
            stats(AggregateMetric::Running {
                offset: 1,
                metric: Box::new(AggregateMetric::Constant(1.0)),
            }),
        ];
        match &optimize_last(steps, None)[0] {
            ExecutionStep::IterateStats {
                string_term_subset,
                int_term_subset,
                stats,
                ..
            } => {
                let terms: Vec<_> = string_term_subset.iter().flatten().cloned().collect();
                assert_eq!(terms, vec!["gb", "us"]);
                assert!(int_term_subset.is_none());
                assert!(matches!(stats[0], AggregateMetric::Running { offset: 0, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_independent_precomputes_merge() {
        let steps = optimize_last(
            vec![distinct("v0"), distinct("v1"), stats(AggregateMetric::Constant(1.0))],
            None,
        );
        assert_eq!(steps.len(), 2);
        match &steps[0] {
            ExecutionStep::ComputeManyPrecomputed { computations, .. } => assert_eq!(computations.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dependent_precomputes_stay_apart() {
        let dependent = ExecutionStep::ComputePrecomputed {
            scope: scope(),
            computation: Precomputed::SumAcross {
                field: country(),
                metric: AggregateMetric::GroupStatsLookup("v0".into()),
                filter: None,
            },
            name: "v1".into(),
        };
        let steps = optimize_last(vec![distinct("v0"), dependent, stats(AggregateMetric::Constant(1.0))], None);
        assert_eq!(steps.len(), 3);
        assert!(matches!(&steps[0], ExecutionStep::ComputePrecomputed { name, .. } if name == "v0"));
        assert!(matches!(&steps[1], ExecutionStep::ComputePrecomputed { name, .. } if name == "v1"));
    }
}
