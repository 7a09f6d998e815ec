//! Group-level metrics
//!
//! An [`AggregateMetric`] computes one number per group from the per-group
//! sums of doc metrics. Some variants (distinct counts, percentiles, field
//! extremes, sums across a nested grouping) need a full term iteration; the
//! precompute extraction pass replaces those with named lookups before the
//! tree is lowered with [`AggregateMetric::to_execution_metric`].
//!
//! ```text
//! DISTINCT(country) + 1
//!   ──extract──▶  Add[GroupStatsLookup("v0"), Constant(1)]
//!   ──lower────▶  ExecMetric::Binary(+, PerGroupConstant(v0), Constant(1))
//! ```

use serde::ser::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::aggregate_filter::AggregateFilter;
use super::doc_filter::DocFilter;
use super::doc_metric::DocMetric;
use super::error::{internal, CompileResult};
use super::group_by::GroupBy;
use super::ops::MathOp;
use super::validation::{ErrorCollector, ValidationHelper};
use crate::execution::{ExecMetric, GroupKeySet, NamedLookups, QualifiedPush, UnaryOp};
use crate::fields::FieldSet;

/// Rewrite functions applied post-order by the `transform` methods of every
/// algebra. Each function sees a node whose children were already rewritten.
#[derive(Clone, Copy)]
pub struct Rewrite<'a> {
    pub aggregate_metric: &'a dyn Fn(AggregateMetric) -> AggregateMetric,
    pub doc_metric: &'a dyn Fn(DocMetric) -> DocMetric,
    pub aggregate_filter: &'a dyn Fn(AggregateFilter) -> AggregateFilter,
    pub doc_filter: &'a dyn Fn(DocFilter) -> DocFilter,
    pub group_by: &'a dyn Fn(GroupBy) -> GroupBy,
}

fn same<T>(value: T) -> T {
    value
}

impl<'a> Rewrite<'a> {
    pub fn identity() -> Rewrite<'static> {
        Rewrite {
            aggregate_metric: &same::<AggregateMetric>,
            doc_metric: &same::<DocMetric>,
            aggregate_filter: &same::<AggregateFilter>,
            doc_filter: &same::<DocFilter>,
            group_by: &same::<GroupBy>,
        }
    }

    /// Only rewrite aggregate metrics
    pub fn aggregate_metrics(f: &'a dyn Fn(AggregateMetric) -> AggregateMetric) -> Rewrite<'a> {
        Rewrite {
            aggregate_metric: f,
            doc_metric: &same::<DocMetric>,
            aggregate_filter: &same::<AggregateFilter>,
            doc_filter: &same::<DocFilter>,
            group_by: &same::<GroupBy>,
        }
    }
}

/// One-level rewrite used by stateful passes
pub type Traversal<'a> = dyn FnMut(AggregateMetric) -> CompileResult<AggregateMetric> + 'a;

/// Per-group numeric expression
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateMetric {
    /// Built through [`AggregateMetric::add`]
    Add(Vec<AggregateMetric>),
    Binary {
        op: MathOp,
        left: Box<AggregateMetric>,
        right: Box<AggregateMetric>,
    },
    Log(Box<AggregateMetric>),
    Abs(Box<AggregateMetric>),
    Negate(Box<AggregateMetric>),
    Floor(Box<AggregateMetric>),
    Ceil(Box<AggregateMetric>),
    Round(Box<AggregateMetric>),
    /// Doc metric summed per group, over every dataset in scope
    DocStats(DocMetric),
    /// Doc metric summed per group in one dataset
    DocStatsPushes {
        dataset: String,
        metric: DocMetric,
    },
    /// Same metric evaluated on the parent group
    Parent(Box<AggregateMetric>),
    /// Value of the group `lag` positions earlier under the same parent
    Lag {
        lag: usize,
        metric: Box<AggregateMetric>,
    },
    /// Value of the term `lag` positions earlier during iteration
    IterateLag {
        lag: usize,
        metric: Box<AggregateMetric>,
    },
    Window {
        window: usize,
        metric: Box<AggregateMetric>,
    },
    Running {
        offset: i64,
        metric: Box<AggregateMetric>,
    },
    Distinct {
        field: FieldSet,
        filter: Option<Box<AggregateFilter>>,
        window: Option<usize>,
    },
    Percentile {
        field: FieldSet,
        percentile: f64,
    },
    /// Term of `field` with the smallest `metric`; defaults to the field's average
    FieldMin {
        field: FieldSet,
        metric: Option<Box<AggregateMetric>>,
        filter: Option<Box<AggregateFilter>>,
    },
    FieldMax {
        field: FieldSet,
        metric: Option<Box<AggregateMetric>>,
        filter: Option<Box<AggregateFilter>>,
    },
    SumAcross {
        group_by: Box<GroupBy>,
        metric: Box<AggregateMetric>,
    },
    GroupStatsLookup(String),
    GroupStatsMultiLookup(Vec<String>),
    IfThenElse {
        condition: Box<AggregateFilter>,
        then: Box<AggregateMetric>,
        otherwise: Box<AggregateMetric>,
    },
    Min(Vec<AggregateMetric>),
    Max(Vec<AggregateMetric>),
    Qualified {
        datasets: BTreeSet<String>,
        metric: Box<AggregateMetric>,
    },
    /// `metric AS name`
    Named {
        metric: Box<AggregateMetric>,
        name: String,
    },
    /// Reference to a named metric, replaced before extraction
    NeedsSubstitution(String),
    Bootstrap {
        field: FieldSet,
        filter: Option<Box<AggregateFilter>>,
        seed: String,
        metric: Box<AggregateMetric>,
        num_bootstraps: u32,
        varargs: Vec<String>,
    },
    Constant(f64),
    /// Average per document
    DivideByCount(Box<AggregateMetric>),
}

impl AggregateMetric {
    /// Sum that flattens nested sums and folds constants
    pub fn add(metrics: Vec<AggregateMetric>) -> AggregateMetric {
        let mut terms = Vec::with_capacity(metrics.len());
        let mut constant = 0.0;
        let mut has_constant = false;
        let mut pending = metrics;
        while let Some(metric) = pending.pop() {
            match metric {
                AggregateMetric::Add(inner) => pending.extend(inner),
                AggregateMetric::Constant(v) => {
                    constant += v;
                    has_constant = true;
                }
                other => terms.push(other),
            }
        }
        terms.reverse();
        if has_constant && (constant != 0.0 || terms.is_empty()) {
            terms.push(AggregateMetric::Constant(constant));
        }
        match terms.len() {
            0 => AggregateMetric::Constant(0.0),
            1 => terms.remove(0),
            _ => AggregateMetric::Add(terms),
        }
    }

    pub fn binary(op: MathOp, left: AggregateMetric, right: AggregateMetric) -> AggregateMetric {
        AggregateMetric::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn divide(left: AggregateMetric, right: AggregateMetric) -> AggregateMetric {
        Self::binary(MathOp::Divide, left, right)
    }

    pub fn if_then_else(
        condition: AggregateFilter,
        then: AggregateMetric,
        otherwise: AggregateMetric,
    ) -> AggregateMetric {
        AggregateMetric::IfThenElse {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    /// Whether the value of a group depends on the groups around it
    pub fn is_ordered(&self) -> bool {
        match self {
            AggregateMetric::Lag { .. }
            | AggregateMetric::IterateLag { .. }
            | AggregateMetric::Window { .. }
            | AggregateMetric::Running { .. } => true,
            AggregateMetric::Distinct { window, filter, .. } => {
                window.is_some() || filter.as_ref().map(|f| f.is_ordered()).unwrap_or(false)
            }
            AggregateMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => condition.is_ordered() || then.is_ordered() || otherwise.is_ordered(),
            _ => self.children().any(AggregateMetric::is_ordered),
        }
    }

    /// Whether computing this metric needs a full term iteration
    pub fn requires_ftgs(&self) -> bool {
        match self {
            AggregateMetric::Distinct { .. }
            | AggregateMetric::Percentile { .. }
            | AggregateMetric::FieldMin { .. }
            | AggregateMetric::FieldMax { .. }
            | AggregateMetric::SumAcross { .. }
            | AggregateMetric::Bootstrap { .. } => true,
            AggregateMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => condition.requires_ftgs() || then.requires_ftgs() || otherwise.requires_ftgs(),
            _ => self.children().any(AggregateMetric::requires_ftgs),
        }
    }

    /// Direct metric children, not including metrics inside nested filters
    fn children(&self) -> Box<dyn Iterator<Item = &AggregateMetric> + '_> {
        use AggregateMetric::*;
        match self {
            Add(ms) | Min(ms) | Max(ms) => Box::new(ms.iter()),
            Binary { left, right, .. } => Box::new([left.as_ref(), right.as_ref()].into_iter()),
            Log(m) | Abs(m) | Negate(m) | Floor(m) | Ceil(m) | Round(m) | Parent(m)
            | DivideByCount(m) => Box::new(std::iter::once(m.as_ref())),
            Lag { metric, .. }
            | IterateLag { metric, .. }
            | Window { metric, .. }
            | Running { metric, .. }
            | SumAcross { metric, .. }
            | Qualified { metric, .. }
            | Named { metric, .. }
            | Bootstrap { metric, .. } => Box::new(std::iter::once(metric.as_ref())),
            FieldMin { metric, .. } | FieldMax { metric, .. } => Box::new(metric.iter().map(|m| m.as_ref())),
            IfThenElse { then, otherwise, .. } => Box::new([then.as_ref(), otherwise.as_ref()].into_iter()),
            _ => Box::new(std::iter::empty()),
        }
    }

    /// Post-order rewrite of the whole tree
    pub fn transform(self, r: &Rewrite<'_>) -> AggregateMetric {
        use AggregateMetric::*;
        let boxed = |m: Box<AggregateMetric>| Box::new(m.transform(r));
        let filter = |f: Option<Box<AggregateFilter>>| f.map(|f| Box::new(f.transform(r)));
        let rebuilt = match self {
            Add(ms) => AggregateMetric::add(ms.into_iter().map(|m| m.transform(r)).collect()),
            Min(ms) => Min(ms.into_iter().map(|m| m.transform(r)).collect()),
            Max(ms) => Max(ms.into_iter().map(|m| m.transform(r)).collect()),
            Binary { op, left, right } => Binary {
                op,
                left: boxed(left),
                right: boxed(right),
            },
            Log(m) => Log(boxed(m)),
            Abs(m) => Abs(boxed(m)),
            Negate(m) => Negate(boxed(m)),
            Floor(m) => Floor(boxed(m)),
            Ceil(m) => Ceil(boxed(m)),
            Round(m) => Round(boxed(m)),
            Parent(m) => Parent(boxed(m)),
            DivideByCount(m) => DivideByCount(boxed(m)),
            DocStats(m) => DocStats(m.transform(r.doc_metric, r.doc_filter)),
            DocStatsPushes { dataset, metric } => DocStatsPushes {
                dataset,
                metric: metric.transform(r.doc_metric, r.doc_filter),
            },
            Lag { lag, metric } => Lag {
                lag,
                metric: boxed(metric),
            },
            IterateLag { lag, metric } => IterateLag {
                lag,
                metric: boxed(metric),
            },
            Window { window, metric } => Window {
                window,
                metric: boxed(metric),
            },
            Running { offset, metric } => Running {
                offset,
                metric: boxed(metric),
            },
            Distinct {
                field,
                filter: f,
                window,
            } => Distinct {
                field,
                filter: filter(f),
                window,
            },
            FieldMin {
                field,
                metric,
                filter: f,
            } => FieldMin {
                field,
                metric: metric.map(boxed),
                filter: filter(f),
            },
            FieldMax {
                field,
                metric,
                filter: f,
            } => FieldMax {
                field,
                metric: metric.map(boxed),
                filter: filter(f),
            },
            SumAcross { group_by, metric } => SumAcross {
                group_by: Box::new(group_by.transform(r)),
                metric: boxed(metric),
            },
            IfThenElse {
                condition,
                then,
                otherwise,
            } => IfThenElse {
                condition: Box::new(condition.transform(r)),
                then: boxed(then),
                otherwise: boxed(otherwise),
            },
            Qualified { datasets, metric } => Qualified {
                datasets,
                metric: boxed(metric),
            },
            Named { metric, name } => Named {
                metric: boxed(metric),
                name,
            },
            Bootstrap {
                field,
                filter: f,
                seed,
                metric,
                num_bootstraps,
                varargs,
            } => Bootstrap {
                field,
                filter: filter(f),
                seed,
                metric: boxed(metric),
                num_bootstraps,
                varargs,
            },
            leaf => leaf,
        };
        (r.aggregate_metric)(rebuilt)
    }

    /// Apply `f` to each direct metric child, including metrics held by
    /// nested filters and group-bys, without recursing further
    pub fn traverse1(self, f: &mut Traversal<'_>) -> CompileResult<AggregateMetric> {
        use AggregateMetric::*;
        Ok(match self {
            Add(ms) => AggregateMetric::add(ms.into_iter().map(&mut *f).collect::<CompileResult<_>>()?),
            Min(ms) => Min(ms.into_iter().map(&mut *f).collect::<CompileResult<_>>()?),
            Max(ms) => Max(ms.into_iter().map(&mut *f).collect::<CompileResult<_>>()?),
            Binary { op, left, right } => {
                let left = Box::new(f(*left)?);
                let right = Box::new(f(*right)?);
                Binary { op, left, right }
            }
            Log(m) => Log(Box::new(f(*m)?)),
            Abs(m) => Abs(Box::new(f(*m)?)),
            Negate(m) => Negate(Box::new(f(*m)?)),
            Floor(m) => Floor(Box::new(f(*m)?)),
            Ceil(m) => Ceil(Box::new(f(*m)?)),
            Round(m) => Round(Box::new(f(*m)?)),
            Parent(m) => Parent(Box::new(f(*m)?)),
            DivideByCount(m) => DivideByCount(Box::new(f(*m)?)),
            Lag { lag, metric } => Lag {
                lag,
                metric: Box::new(f(*metric)?),
            },
            IterateLag { lag, metric } => IterateLag {
                lag,
                metric: Box::new(f(*metric)?),
            },
            Window { window, metric } => Window {
                window,
                metric: Box::new(f(*metric)?),
            },
            Running { offset, metric } => Running {
                offset,
                metric: Box::new(f(*metric)?),
            },
            Distinct {
                field,
                filter: x,
                window,
            } => Distinct {
                field,
                filter: traverse_filter(x.map(|x| *x), f)?.map(Box::new),
                window,
            },
            FieldMin {
                field,
                metric,
                filter: x,
            } => FieldMin {
                field,
                metric: traverse_metric(metric.map(|m| *m), f)?.map(Box::new),
                filter: traverse_filter(x.map(|x| *x), f)?.map(Box::new),
            },
            FieldMax {
                field,
                metric,
                filter: x,
            } => FieldMax {
                field,
                metric: traverse_metric(metric.map(|m| *m), f)?.map(Box::new),
                filter: traverse_filter(x.map(|x| *x), f)?.map(Box::new),
            },
            SumAcross { group_by, metric } => SumAcross {
                group_by: Box::new(group_by.traverse1(f)?),
                metric: Box::new(f(*metric)?),
            },
            IfThenElse {
                condition,
                then,
                otherwise,
            } => IfThenElse {
                condition: Box::new(condition.traverse1(f)?),
                then: Box::new(f(*then)?),
                otherwise: Box::new(f(*otherwise)?),
            },
            Qualified { datasets, metric } => Qualified {
                datasets,
                metric: Box::new(f(*metric)?),
            },
            Named { metric, name } => Named {
                metric: Box::new(f(*metric)?),
                name,
            },
            Bootstrap {
                field,
                filter: x,
                seed,
                metric,
                num_bootstraps,
                varargs,
            } => Bootstrap {
                field,
                filter: traverse_filter(x.map(|x| *x), f)?.map(Box::new),
                seed,
                metric: Box::new(f(*metric)?),
                num_bootstraps,
                varargs,
            },
            leaf => leaf,
        })
    }

    /// Check fields and types. Only valid on extracted trees: variants that
    /// the precompute pass removes are reported as internal errors.
    pub fn validate(
        &self,
        scope: &BTreeSet<String>,
        helper: &ValidationHelper,
        errors: &mut ErrorCollector,
    ) -> CompileResult<()> {
        use AggregateMetric::*;
        match self {
            DocStats(metric) => {
                for dataset in scope {
                    metric.validate(dataset, helper, errors);
                }
                Ok(())
            }
            DocStatsPushes { dataset, metric } => {
                metric.validate(dataset, helper, errors);
                Ok(())
            }
            IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                condition.validate(scope, helper, errors)?;
                then.validate(scope, helper, errors)?;
                otherwise.validate(scope, helper, errors)
            }
            Lag { lag, metric } | IterateLag { lag, metric } => {
                if *lag == 0 {
                    errors.error("Lag must be at least 1");
                }
                metric.validate(scope, helper, errors)
            }
            Window { window, metric } => {
                if *window == 0 {
                    errors.error("Window size must be at least 1");
                }
                metric.validate(scope, helper, errors)
            }
            Distinct { .. }
            | Percentile { .. }
            | FieldMin { .. }
            | FieldMax { .. }
            | SumAcross { .. }
            | Bootstrap { .. }
            | Parent(_)
            | Qualified { .. }
            | DivideByCount(_) => internal(format!("Should be extracted by ExtractPrecomputed: {}", self)),
            Named { .. } | NeedsSubstitution(_) => {
                internal(format!("Named metrics should be substituted before validation: {}", self))
            }
            _ => {
                for child in self.children() {
                    child.validate(scope, helper, errors)?;
                }
                Ok(())
            }
        }
    }

    /// Lower an extracted tree to the execution algebra
    pub fn to_execution_metric(
        &self,
        lookups: &NamedLookups,
        keys: &Arc<GroupKeySet>,
    ) -> CompileResult<ExecMetric> {
        use AggregateMetric::*;
        let lower = |m: &AggregateMetric| m.to_execution_metric(lookups, keys);
        let unary = |op: UnaryOp, m: &AggregateMetric| Ok(ExecMetric::unary(op, lower(m)?));
        match self {
            Add(ms) => {
                let mut lowered = ms.iter().map(lower);
                match lowered.next() {
                    None => Ok(ExecMetric::Constant(0.0)),
                    Some(first) => lowered.try_fold(first?, |acc, next| {
                        Ok(ExecMetric::binary(MathOp::Add, acc, next?))
                    }),
                }
            }
            Binary { op, left, right } => Ok(ExecMetric::binary(*op, lower(left)?, lower(right)?)),
            Log(m) => unary(UnaryOp::Log, m),
            Abs(m) => unary(UnaryOp::Abs, m),
            Floor(m) => unary(UnaryOp::Floor, m),
            Ceil(m) => unary(UnaryOp::Ceil, m),
            Round(m) => unary(UnaryOp::Round, m),
            Negate(m) => Ok(ExecMetric::binary(MathOp::Subtract, ExecMetric::Constant(0.0), lower(m)?)),
            DocStatsPushes { dataset, metric } => Ok(ExecMetric::document_level(QualifiedPush::new(
                dataset.clone(),
                metric.get_pushes(dataset)?,
            ))),
            Lag { lag, metric } => Ok(ExecMetric::ParentLag {
                delta: *lag,
                metric: Box::new(lower(metric)?),
                keys: Arc::clone(keys),
            }),
            IterateLag { lag, metric } => Ok(ExecMetric::iterate_lag(*lag, lower(metric)?)),
            Window { window, metric } => Ok(ExecMetric::window(*window, lower(metric)?, Arc::clone(keys))),
            Running { offset, metric } => Ok(ExecMetric::running(*offset, lower(metric)?, Arc::clone(keys))),
            GroupStatsLookup(name) => Ok(ExecMetric::PerGroupConstant {
                name: name.clone(),
                values: lookups.get(name)?,
            }),
            GroupStatsMultiLookup(names) => Ok(ExecMetric::MultiPerGroupConstant {
                names: names.clone(),
                values: names
                    .iter()
                    .map(|n| lookups.get(n))
                    .collect::<Result<_, _>>()?,
            }),
            IfThenElse {
                condition,
                then,
                otherwise,
            } => Ok(ExecMetric::IfThenElse {
                condition: Box::new(condition.to_execution_filter(lookups, keys)?),
                then: Box::new(lower(then)?),
                otherwise: Box::new(lower(otherwise)?),
            }),
            Min(ms) => Ok(ExecMetric::Min(ms.iter().map(lower).collect::<CompileResult<_>>()?)),
            Max(ms) => Ok(ExecMetric::Max(ms.iter().map(lower).collect::<CompileResult<_>>()?)),
            Constant(v) => Ok(ExecMetric::Constant(*v)),
            NeedsSubstitution(name) => internal(format!("Unsubstituted metric reference: {}", name)),
            DocStats(_)
            | Parent(_)
            | Distinct { .. }
            | Percentile { .. }
            | FieldMin { .. }
            | FieldMax { .. }
            | SumAcross { .. }
            | Qualified { .. }
            | Named { .. }
            | Bootstrap { .. }
            | DivideByCount(_) => internal(format!("Should be extracted by ExtractPrecomputed: {}", self)),
        }
    }
}

/// Apply a one-level traversal to an optional metric
pub(crate) fn traverse_metric(
    metric: Option<AggregateMetric>,
    f: &mut Traversal<'_>,
) -> CompileResult<Option<AggregateMetric>> {
    metric.map(|m| f(m)).transpose()
}

/// Apply a one-level traversal to the metrics of an optional filter
pub(crate) fn traverse_filter(
    filter: Option<AggregateFilter>,
    f: &mut Traversal<'_>,
) -> CompileResult<Option<AggregateFilter>> {
    filter.map(|x| x.traverse1(f)).transpose()
}

impl fmt::Display for AggregateMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AggregateMetric::*;
        let list = |ms: &[AggregateMetric]| ms.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ");
        match self {
            Add(ms) => write!(
                f,
                "({})",
                ms.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(" + ")
            ),
            Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Log(m) => write!(f, "log({})", m),
            Abs(m) => write!(f, "abs({})", m),
            Negate(m) => write!(f, "-{}", m),
            Floor(m) => write!(f, "floor({})", m),
            Ceil(m) => write!(f, "ceil({})", m),
            Round(m) => write!(f, "round({})", m),
            DocStats(m) => write!(f, "[{:?}]", m),
            DocStatsPushes { dataset, metric } => match metric.get_pushes(dataset) {
                Ok(pushes) => write!(f, "{}.[{}]", dataset, pushes.join(" ")),
                Err(_) => write!(f, "{}.[{:?}]", dataset, metric),
            },
            Parent(m) => write!(f, "parent({})", m),
            Lag { lag, metric } => write!(f, "lag({}, {})", lag, metric),
            IterateLag { lag, metric } => write!(f, "iterate_lag({}, {})", lag, metric),
            Window { window, metric } => write!(f, "window({}, {})", window, metric),
            Running { offset, metric } => write!(f, "running({}, {})", offset, metric),
            Distinct { field, filter, window } => {
                write!(f, "distinct({}", field)?;
                if let Some(filter) = filter {
                    write!(f, " having {}", filter)?;
                }
                if let Some(window) = window {
                    write!(f, ", window {}", window)?;
                }
                f.write_str(")")
            }
            Percentile { field, percentile } => write!(f, "percentile({}, {})", field, percentile),
            FieldMin { field, metric, .. } | FieldMax { field, metric, .. } => {
                let name = if matches!(self, FieldMin { .. }) { "field_min" } else { "field_max" };
                match metric {
                    Some(m) => write!(f, "{}({} by {})", name, field, m),
                    None => write!(f, "{}({})", name, field),
                }
            }
            SumAcross { group_by, metric } => write!(f, "sum_across({:?}, {})", group_by, metric),
            GroupStatsLookup(name) => write!(f, "lookup({})", name),
            GroupStatsMultiLookup(names) => write!(f, "lookup({})", names.join(", ")),
            IfThenElse {
                condition,
                then,
                otherwise,
            } => write!(f, "if {} then {} else {}", condition, then, otherwise),
            Min(ms) => write!(f, "min({})", list(ms)),
            Max(ms) => write!(f, "max({})", list(ms)),
            Qualified { datasets, metric } => write!(
                f,
                "[{}].{}",
                datasets.iter().cloned().collect::<Vec<_>>().join(", "),
                metric
            ),
            Named { metric, name } => write!(f, "{} as {}", metric, name),
            NeedsSubstitution(name) => f.write_str(name),
            Bootstrap {
                field,
                seed,
                metric,
                num_bootstraps,
                ..
            } => write!(f, "bootstrap({}, {}, \"{}\", {})", field, metric, seed, num_bootstraps),
            Constant(v) => write!(f, "{}", v),
            DivideByCount(m) => write!(f, "avg({})", m),
        }
    }
}

impl Serialize for AggregateMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::CompileError;
    use std::cell::RefCell;

    fn clicks() -> AggregateMetric {
        AggregateMetric::DocStatsPushes {
            dataset: "js".into(),
            metric: DocMetric::Field(FieldSet::single("js", "clicks")),
        }
    }

    fn window(m: AggregateMetric) -> AggregateMetric {
        AggregateMetric::Window {
            window: 1,
            metric: Box::new(m),
        }
    }

    #[test]
    fn test_is_ordered_propagates() {
        assert!(window(AggregateMetric::Constant(5.0)).is_ordered());
        assert!(!AggregateMetric::add(vec![clicks(), AggregateMetric::Constant(2.0)]).is_ordered());
        assert!(AggregateMetric::add(vec![window(clicks()), AggregateMetric::Constant(1.0)]).is_ordered());
        assert!(AggregateMetric::Parent(Box::new(window(clicks()))).is_ordered());
        assert!(!AggregateMetric::Parent(Box::new(clicks())).is_ordered());
    }

    #[test]
    fn test_requires_ftgs_propagates() {
        let distinct = AggregateMetric::Distinct {
            field: FieldSet::single("js", "country"),
            filter: None,
            window: None,
        };
        assert!(distinct.requires_ftgs());
        assert!(AggregateMetric::add(vec![distinct, AggregateMetric::Constant(1.0)]).requires_ftgs());
        assert!(!clicks().requires_ftgs());
    }

    #[test]
    fn test_add_folds_constants() {
        assert_eq!(
            AggregateMetric::add(vec![AggregateMetric::Constant(2.0), AggregateMetric::Constant(3.0)]),
            AggregateMetric::Constant(5.0)
        );
        let nested = AggregateMetric::add(vec![
            AggregateMetric::add(vec![clicks(), AggregateMetric::GroupStatsLookup("v0".into())]),
            AggregateMetric::Constant(1.0),
        ]);
        assert_eq!(
            nested,
            AggregateMetric::Add(vec![
                clicks(),
                AggregateMetric::GroupStatsLookup("v0".into()),
                AggregateMetric::Constant(1.0)
            ])
        );
    }

    #[test]
    fn test_transform_is_post_order() {
        let seen = RefCell::new(Vec::new());
        let record = |m: AggregateMetric| {
            seen.borrow_mut().push(m.to_string());
            m
        };
        let tree = AggregateMetric::Negate(Box::new(AggregateMetric::Abs(Box::new(AggregateMetric::Constant(1.0)))));
        tree.transform(&Rewrite::aggregate_metrics(&record));
        assert_eq!(*seen.borrow(), vec!["1", "abs(1)", "-abs(1)"]);
    }

    #[test]
    fn test_traverse1_is_one_level() {
        let tree = AggregateMetric::Negate(Box::new(AggregateMetric::Abs(Box::new(AggregateMetric::Constant(1.0)))));
        let mut calls = 0;
        let result = tree
            .traverse1(&mut |m| {
                calls += 1;
                Ok(AggregateMetric::Floor(Box::new(m)))
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(result.to_string(), "-floor(abs(1))");
    }

    #[test]
    fn test_lowering() {
        let keys = GroupKeySet::root();
        let mut lookups = NamedLookups::new();
        lookups.insert("v0", vec![0.0, 4.0]);
        let metric = AggregateMetric::add(vec![
            AggregateMetric::GroupStatsLookup("v0".into()),
            AggregateMetric::Negate(Box::new(AggregateMetric::Constant(1.0))),
        ]);
        let lowered = metric.to_execution_metric(&lookups, &keys).unwrap();
        assert_eq!(lowered.group_stats(&[], 1).unwrap(), vec![-1.0, 3.0]);

        let pushes = clicks().to_execution_metric(&lookups, &keys).unwrap();
        assert_eq!(
            pushes.requires().into_iter().collect::<Vec<_>>(),
            vec![QualifiedPush::new("js", vec!["clicks".into()])]
        );
    }

    #[test]
    fn test_lowering_unextracted_is_internal_error() {
        let keys = GroupKeySet::root();
        let distinct = AggregateMetric::Distinct {
            field: FieldSet::single("js", "country"),
            filter: None,
            window: None,
        };
        let err = distinct.to_execution_metric(&NamedLookups::new(), &keys).unwrap_err();
        assert!(matches!(err, CompileError::Internal(_)));

        let missing = AggregateMetric::GroupStatsLookup("v9".into())
            .to_execution_metric(&NamedLookups::new(), &keys)
            .unwrap_err();
        assert!(matches!(missing, CompileError::Execution(_)));
    }

    #[test]
    fn test_validate_rejects_unextracted() {
        let helper = ValidationHelper::default();
        let mut errors = ErrorCollector::new();
        let scope: BTreeSet<String> = ["js".to_string()].into_iter().collect();
        let parent = AggregateMetric::Parent(Box::new(clicks()));
        assert!(parent.validate(&scope, &helper, &mut errors).is_err());
    }
}
