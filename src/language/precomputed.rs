//! Per-group values that need their own engine pass
//!
//! The precompute extraction pass replaces metrics such as `DISTINCT(f)` with
//! a named lookup and records a [`Precomputed`] describing how to fill it.
//! A [`Precomputation`] is the command sequence computing one such value:
//! setup commands, the computation whose result is stored under the lookup
//! name, and teardown commands.

use std::collections::BTreeSet;

use super::aggregate_filter::AggregateFilter;
use super::aggregate_metric::{traverse_filter, AggregateMetric, Rewrite, Traversal};
use super::commands::{Command, GroupLookupMergeType};
use super::doc_metric::DocMetric;
use super::error::{internal, CompileResult};
use super::group_by::GroupBy;
use crate::fields::FieldSet;

#[derive(Debug, Clone, PartialEq)]
pub enum Precomputed {
    Distinct {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        window: Option<usize>,
    },
    Percentile {
        field: FieldSet,
        percentile: f64,
    },
    /// Doc metric summed per group, needed at a shallower depth than it was written
    RawStats(DocMetric),
    SumAcross {
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    SumAcrossGroupBy {
        group_by: GroupBy,
        metric: AggregateMetric,
    },
    FieldExtremeValue {
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    Bootstrap {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        seed: String,
        metric: AggregateMetric,
        num_bootstraps: u32,
        varargs: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Precomputation {
    pub before: Vec<Command>,
    pub computation: Command,
    pub after: Vec<Command>,
}

impl Precomputation {
    pub fn no_context(computation: Command) -> Self {
        Self {
            before: Vec::new(),
            computation,
            after: Vec::new(),
        }
    }

    pub fn has_context(&self) -> bool {
        !self.before.is_empty() || !self.after.is_empty()
    }
}

impl Precomputed {
    pub fn commands(&self, scope: &BTreeSet<String>) -> CompileResult<Precomputation> {
        let check_scope = |field: &FieldSet| {
            if field.datasets() != *scope {
                return internal(format!(
                    "Precomputed field scope {:?} does not match computation scope {:?}",
                    field.datasets(),
                    scope
                ));
            }
            Ok(())
        };
        Ok(match self {
            Precomputed::Distinct { field, filter, window } => Precomputation::no_context(Command::GetGroupDistincts {
                field: field.clone(),
                filter: filter.clone(),
                window_size: window.unwrap_or(1),
            }),
            Precomputed::Percentile { field, percentile } => {
                Precomputation::no_context(Command::GetGroupPercentiles {
                    field: field.clone(),
                    percentiles: vec![*percentile],
                })
            }
            Precomputed::RawStats(metric) => {
                let pushes = scope
                    .iter()
                    .map(|dataset| AggregateMetric::DocStatsPushes {
                        dataset: dataset.clone(),
                        metric: metric.clone(),
                    })
                    .collect();
                Precomputation::no_context(Command::GetGroupStats {
                    metrics: vec![AggregateMetric::add(pushes)],
                    format_strings: vec![None],
                    return_group_keys: false,
                })
            }
            Precomputed::SumAcross { field, metric, filter } => {
                check_scope(field)?;
                Precomputation::no_context(Command::SumAcross {
                    field: field.clone(),
                    metric: metric.clone(),
                    filter: filter.clone(),
                })
            }
            Precomputed::SumAcrossGroupBy { group_by, metric } => Precomputation {
                before: group_by.execution_step(scope)?.commands()?,
                computation: Command::GetGroupStats {
                    metrics: vec![metric.clone()],
                    format_strings: vec![None],
                    return_group_keys: false,
                },
                after: vec![Command::RegroupIntoParent {
                    merge_type: GroupLookupMergeType::SumAll,
                }],
            },
            Precomputed::FieldExtremeValue { field, metric, filter } => {
                check_scope(field)?;
                Precomputation::no_context(Command::ComputeFieldExtremeValue {
                    field: field.clone(),
                    metric: metric.clone(),
                    filter: filter.clone(),
                })
            }
            Precomputed::Bootstrap {
                field,
                filter,
                seed,
                metric,
                num_bootstraps,
                varargs,
            } => Precomputation::no_context(Command::ComputeBootstrap {
                field: field.clone(),
                filter: filter.clone(),
                seed: seed.clone(),
                metric: metric.clone(),
                num_bootstraps: *num_bootstraps,
                varargs: varargs.clone(),
            }),
        })
    }

    /// Lookup names filled by this computation when stored under `name`
    pub fn output_names(&self, name: &str) -> Vec<String> {
        match self {
            Precomputed::Bootstrap { varargs, .. } => varargs.iter().map(|v| format!("{}.{}", name, v)).collect(),
            _ => vec![name.to_string()],
        }
    }

    pub fn transform(self, r: &Rewrite<'_>) -> Precomputed {
        let filter = |f: Option<AggregateFilter>| f.map(|f| f.transform(r));
        match self {
            Precomputed::Distinct { field, filter: f, window } => Precomputed::Distinct {
                field,
                filter: filter(f),
                window,
            },
            Precomputed::RawStats(metric) => Precomputed::RawStats(metric.transform(r.doc_metric, r.doc_filter)),
            Precomputed::SumAcross {
                field,
                metric,
                filter: f,
            } => Precomputed::SumAcross {
                field,
                metric: metric.transform(r),
                filter: filter(f),
            },
            Precomputed::SumAcrossGroupBy { group_by, metric } => Precomputed::SumAcrossGroupBy {
                group_by: group_by.transform(r),
                metric: metric.transform(r),
            },
            Precomputed::FieldExtremeValue {
                field,
                metric,
                filter: f,
            } => Precomputed::FieldExtremeValue {
                field,
                metric: metric.transform(r),
                filter: filter(f),
            },
            Precomputed::Bootstrap {
                field,
                filter: f,
                seed,
                metric,
                num_bootstraps,
                varargs,
            } => Precomputed::Bootstrap {
                field,
                filter: filter(f),
                seed,
                metric: metric.transform(r),
                num_bootstraps,
                varargs,
            },
            percentile @ Precomputed::Percentile { .. } => percentile,
        }
    }

    pub fn traverse1(self, f: &mut Traversal<'_>) -> CompileResult<Precomputed> {
        Ok(match self {
            Precomputed::Distinct { field, filter: x, window } => Precomputed::Distinct {
                field,
                filter: traverse_filter(x, f)?,
                window,
            },
            Precomputed::SumAcross {
                field,
                metric,
                filter: x,
            } => Precomputed::SumAcross {
                field,
                metric: f(metric)?,
                filter: traverse_filter(x, f)?,
            },
            Precomputed::SumAcrossGroupBy { group_by, metric } => Precomputed::SumAcrossGroupBy {
                group_by: group_by.traverse1(f)?,
                metric: f(metric)?,
            },
            Precomputed::FieldExtremeValue {
                field,
                metric,
                filter: x,
            } => Precomputed::FieldExtremeValue {
                field,
                metric: f(metric)?,
                filter: traverse_filter(x, f)?,
            },
            Precomputed::Bootstrap {
                field,
                filter: x,
                seed,
                metric,
                num_bootstraps,
                varargs,
            } => Precomputed::Bootstrap {
                field,
                filter: traverse_filter(x, f)?,
                seed,
                metric: f(metric)?,
                num_bootstraps,
                varargs,
            },
            other => other,
        })
    }
}
