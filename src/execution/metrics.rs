//! Execution-time metrics
//!
//! [`ExecMetric`] is what group-level metrics lower to once every lookup
//! has been computed. It evaluates over the raw per-group sums returned by
//! the grouping engine, one vector per registered push:
//!
//! ```text
//! stats[push_index][group]      group 0 is unused
//! ```
//!
//! During term iteration the same tree is evaluated one `(term, group)` at a
//! time through [`ExecMetric::apply`], where ordered nodes keep state.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use super::filters::ExecFilter;
use super::group_keys::GroupKeySet;
use super::{ExecutionError, ExecutionResult};
use crate::language::MathOp;
use crate::term::Term;

/// Pushes to run in one dataset session
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualifiedPush {
    pub session_name: String,
    pub pushes: Vec<String>,
}

impl QualifiedPush {
    pub fn new(session_name: impl Into<String>, pushes: Vec<String>) -> Self {
        Self {
            session_name: session_name.into(),
            pushes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Log,
    Abs,
    Floor,
    Ceil,
    Round,
}

impl UnaryOp {
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            UnaryOp::Log => value.ln(),
            UnaryOp::Abs => value.abs(),
            UnaryOp::Floor => value.floor(),
            UnaryOp::Ceil => value.ceil(),
            UnaryOp::Round => value.round(),
        }
    }
}

/// Group-level metric ready for evaluation
#[derive(Debug, Clone)]
pub enum ExecMetric {
    Constant(f64),
    Unary {
        op: UnaryOp,
        metric: Box<ExecMetric>,
    },
    Binary {
        op: MathOp,
        left: Box<ExecMetric>,
        right: Box<ExecMetric>,
    },
    Min(Vec<ExecMetric>),
    Max(Vec<ExecMetric>),
    IfThenElse {
        condition: Box<ExecFilter>,
        then: Box<ExecMetric>,
        otherwise: Box<ExecMetric>,
    },
    /// Sum of a doc metric per group, filled in by `register`
    DocumentLevel {
        push: QualifiedPush,
        index: Option<usize>,
    },
    /// Values computed by an earlier command
    PerGroupConstant {
        name: String,
        values: Arc<Vec<f64>>,
    },
    /// Several lookups rendered as consecutive columns
    MultiPerGroupConstant {
        names: Vec<String>,
        values: Vec<Arc<Vec<f64>>>,
    },
    /// Value of the group `delta` positions earlier under the same parent
    ParentLag {
        delta: usize,
        metric: Box<ExecMetric>,
        keys: Arc<GroupKeySet>,
    },
    /// Sum over the last `size` groups under the same parent
    Window {
        size: usize,
        metric: Box<ExecMetric>,
        keys: Arc<GroupKeySet>,
        sums: Vec<f64>,
    },
    /// Cumulative sum under the same parent
    Running {
        offset: i64,
        metric: Box<ExecMetric>,
        keys: Arc<GroupKeySet>,
        sums: Vec<f64>,
    },
    /// Value seen `delta` terms earlier in the same group
    IterateLag {
        delta: usize,
        metric: Box<ExecMetric>,
        history: BTreeMap<usize, VecDeque<f64>>,
    },
}

impl ExecMetric {
    pub fn binary(op: MathOp, left: ExecMetric, right: ExecMetric) -> ExecMetric {
        ExecMetric::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, metric: ExecMetric) -> ExecMetric {
        ExecMetric::Unary {
            op,
            metric: Box::new(metric),
        }
    }

    pub fn document_level(push: QualifiedPush) -> ExecMetric {
        ExecMetric::DocumentLevel { push, index: None }
    }

    pub fn window(size: usize, metric: ExecMetric, keys: Arc<GroupKeySet>) -> ExecMetric {
        let sums = vec![0.0; keys.num_groups() + 1];
        ExecMetric::Window {
            size,
            metric: Box::new(metric),
            keys,
            sums,
        }
    }

    pub fn running(offset: i64, metric: ExecMetric, keys: Arc<GroupKeySet>) -> ExecMetric {
        let sums = vec![0.0; keys.num_groups() + 1];
        ExecMetric::Running {
            offset,
            metric: Box::new(metric),
            keys,
            sums,
        }
    }

    pub fn iterate_lag(delta: usize, metric: ExecMetric) -> ExecMetric {
        ExecMetric::IterateLag {
            delta,
            metric: Box::new(metric),
            history: BTreeMap::new(),
        }
    }

    /// Pushes that must be computed before evaluation
    pub fn requires(&self) -> BTreeSet<QualifiedPush> {
        let mut required = BTreeSet::new();
        self.collect_requires(&mut required);
        required
    }

    pub(crate) fn collect_requires(&self, required: &mut BTreeSet<QualifiedPush>) {
        match self {
            ExecMetric::DocumentLevel { push, .. } => {
                required.insert(push.clone());
            }
            ExecMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_requires(required);
                then.collect_requires(required);
                otherwise.collect_requires(required);
            }
            _ => self.children().for_each(|m| m.collect_requires(required)),
        }
    }

    /// Record where each required push lives in the stats table
    pub fn register(&mut self, indexes: &BTreeMap<QualifiedPush, usize>) -> ExecutionResult<()> {
        match self {
            ExecMetric::DocumentLevel { push, index } => {
                let found = indexes
                    .get(push)
                    .ok_or_else(|| ExecutionError::Unregistered(push.pushes.join(" ")))?;
                *index = Some(*found);
                Ok(())
            }
            ExecMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                condition.register(indexes)?;
                then.register(indexes)?;
                otherwise.register(indexes)
            }
            _ => {
                for child in self.children_mut() {
                    child.register(indexes)?;
                }
                Ok(())
            }
        }
    }

    /// Whether term iteration must visit terms in sorted order
    pub fn needs_sorted(&self) -> bool {
        match self {
            ExecMetric::Window { .. } | ExecMetric::Running { .. } | ExecMetric::IterateLag { .. } => true,
            ExecMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => condition.needs_sorted() || then.needs_sorted() || otherwise.needs_sorted(),
            _ => self.children().any(ExecMetric::needs_sorted),
        }
    }

    /// Number of output columns
    pub fn width(&self) -> usize {
        match self {
            ExecMetric::MultiPerGroupConstant { values, .. } => values.len(),
            _ => 1,
        }
    }

    /// One value per group, index 0 unused
    pub fn group_stats(&self, stats: &[Vec<f64>], num_groups: usize) -> ExecutionResult<Vec<f64>> {
        let size = num_groups + 1;
        match self {
            ExecMetric::Constant(value) => Ok(vec![*value; size]),
            ExecMetric::Unary { op, metric } => {
                let mut values = metric.group_stats(stats, num_groups)?;
                values.iter_mut().for_each(|v| *v = op.apply(*v));
                Ok(values)
            }
            ExecMetric::Binary { op, left, right } => {
                let mut lhs = left.group_stats(stats, num_groups)?;
                let rhs = right.group_stats(stats, num_groups)?;
                for (l, r) in lhs.iter_mut().zip(rhs) {
                    *l = op.apply(*l, r);
                }
                Ok(lhs)
            }
            ExecMetric::Min(metrics) => fold_all(metrics, stats, num_groups, f64::min),
            ExecMetric::Max(metrics) => fold_all(metrics, stats, num_groups, f64::max),
            ExecMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                let mask = condition.group_stats(stats, num_groups)?;
                let then = then.group_stats(stats, num_groups)?;
                let otherwise = otherwise.group_stats(stats, num_groups)?;
                Ok((0..size)
                    .map(|g| if mask[g] { then[g] } else { otherwise[g] })
                    .collect())
            }
            ExecMetric::DocumentLevel { push, index } => {
                let index = index.ok_or_else(|| ExecutionError::Unregistered(push.pushes.join(" ")))?;
                let column = stats
                    .get(index)
                    .ok_or_else(|| ExecutionError::Unregistered(push.pushes.join(" ")))?;
                Ok((0..size).map(|g| column.get(g).copied().unwrap_or(0.0)).collect())
            }
            ExecMetric::PerGroupConstant { values, .. } => Ok(padded(values, size)),
            ExecMetric::MultiPerGroupConstant { values, .. } => match values.first() {
                Some(first) => Ok(padded(first, size)),
                None => Ok(vec![0.0; size]),
            },
            ExecMetric::ParentLag {
                delta,
                metric,
                keys,
            } => {
                let inner = metric.group_stats(stats, num_groups)?;
                let mut result = vec![0.0; size];
                for group in 1..size {
                    if group > *delta {
                        let previous = group - delta;
                        if keys.parent_group(previous) == keys.parent_group(group) {
                            result[group] = inner[previous];
                        }
                    }
                }
                Ok(result)
            }
            ExecMetric::Window {
                size: window,
                metric,
                keys,
                ..
            } => {
                let inner = metric.group_stats(stats, num_groups)?;
                let mut result = vec![0.0; size];
                let mut sum = 0.0;
                let mut count = 0;
                let mut current_parent = None;
                for group in 1..size {
                    let parent = keys.parent_group(group);
                    if current_parent != Some(parent) {
                        current_parent = Some(parent);
                        sum = 0.0;
                        count = 0;
                    }
                    sum += inner[group];
                    count += 1;
                    if count > *window {
                        sum -= inner[group - window];
                    }
                    result[group] = sum;
                }
                Ok(result)
            }
            ExecMetric::Running {
                offset,
                metric,
                keys,
                ..
            } => {
                let inner = metric.group_stats(stats, num_groups)?;
                // (group, cumulative sum) per parent, in group order
                let mut prefixes: BTreeMap<usize, Vec<(usize, f64)>> = BTreeMap::new();
                for group in 1..size {
                    let prefix = prefixes.entry(keys.parent_group(group)).or_default();
                    let sum = prefix.last().map_or(0.0, |(_, sum)| *sum) + inner[group];
                    prefix.push((group, sum));
                }
                let mut result = vec![0.0; size];
                for group in 1..size {
                    let last = (group as i64).saturating_add(offset.saturating_sub(1));
                    if last < 1 {
                        continue;
                    }
                    if let Some(prefix) = prefixes.get(&keys.parent_group(group)) {
                        let seen = prefix.partition_point(|(g, _)| (*g as i64) <= last);
                        if seen > 0 {
                            result[group] = prefix[seen - 1].1;
                        }
                    }
                }
                Ok(result)
            }
            ExecMetric::IterateLag { .. } => Err(ExecutionError::IterationOnly("IterateLag")),
        }
    }

    /// Value for one `(term, group)` during term iteration.
    /// `stats` holds the registered pushes for that term and group.
    pub fn apply(&mut self, term: &Term, stats: &[f64], group: usize) -> ExecutionResult<f64> {
        match self {
            ExecMetric::Constant(value) => Ok(*value),
            ExecMetric::Unary { op, metric } => Ok(op.apply(metric.apply(term, stats, group)?)),
            ExecMetric::Binary { op, left, right } => {
                let l = left.apply(term, stats, group)?;
                let r = right.apply(term, stats, group)?;
                Ok(op.apply(l, r))
            }
            ExecMetric::Min(metrics) => fold_apply(metrics, term, stats, group, f64::min),
            ExecMetric::Max(metrics) => fold_apply(metrics, term, stats, group, f64::max),
            ExecMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                let then = then.apply(term, stats, group)?;
                let otherwise = otherwise.apply(term, stats, group)?;
                if condition.allow(term, stats, group)? {
                    Ok(then)
                } else {
                    Ok(otherwise)
                }
            }
            ExecMetric::DocumentLevel { push, index } => {
                let index = index.ok_or_else(|| ExecutionError::Unregistered(push.pushes.join(" ")))?;
                stats
                    .get(index)
                    .copied()
                    .ok_or_else(|| ExecutionError::Unregistered(push.pushes.join(" ")))
            }
            ExecMetric::PerGroupConstant { values, .. } => Ok(values.get(group).copied().unwrap_or(0.0)),
            ExecMetric::MultiPerGroupConstant { values, .. } => Ok(values
                .first()
                .and_then(|v| v.get(group).copied())
                .unwrap_or(0.0)),
            ExecMetric::ParentLag { .. } => Err(ExecutionError::GroupStatsOnly("ParentLag")),
            ExecMetric::Window {
                size: window,
                metric,
                keys,
                sums,
            } => {
                let value = metric.apply(term, stats, group)?;
                let parent = keys.parent_group(group);
                for offset in 0..*window {
                    let target = group + offset;
                    if target <= keys.num_groups() && keys.parent_group(target) == parent {
                        if let Some(sum) = sums.get_mut(target) {
                            *sum += value;
                        }
                    }
                }
                Ok(sums.get(group).copied().unwrap_or(0.0))
            }
            ExecMetric::Running { metric, sums, .. } => {
                let value = metric.apply(term, stats, group)?;
                if group >= sums.len() {
                    sums.resize(group + 1, 0.0);
                }
                sums[group] += value;
                Ok(sums[group])
            }
            ExecMetric::IterateLag {
                delta,
                metric,
                history,
            } => {
                let value = metric.apply(term, stats, group)?;
                let seen = history.entry(group).or_default();
                seen.push_back(value);
                if seen.len() > *delta {
                    Ok(seen.pop_front().unwrap_or(0.0))
                } else {
                    Ok(0.0)
                }
            }
        }
    }

    fn children(&self) -> Box<dyn Iterator<Item = &ExecMetric> + '_> {
        match self {
            ExecMetric::Unary { metric, .. }
            | ExecMetric::ParentLag { metric, .. }
            | ExecMetric::Window { metric, .. }
            | ExecMetric::Running { metric, .. }
            | ExecMetric::IterateLag { metric, .. } => Box::new(std::iter::once(metric.as_ref())),
            ExecMetric::Binary { left, right, .. } => {
                Box::new(std::iter::once(left.as_ref()).chain(std::iter::once(right.as_ref())))
            }
            ExecMetric::Min(metrics) | ExecMetric::Max(metrics) => Box::new(metrics.iter()),
            ExecMetric::IfThenElse { then, otherwise, .. } => {
                Box::new(std::iter::once(then.as_ref()).chain(std::iter::once(otherwise.as_ref())))
            }
            _ => Box::new(std::iter::empty()),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut ExecMetric> {
        match self {
            ExecMetric::Unary { metric, .. }
            | ExecMetric::ParentLag { metric, .. }
            | ExecMetric::Window { metric, .. }
            | ExecMetric::Running { metric, .. }
            | ExecMetric::IterateLag { metric, .. } => vec![metric.as_mut()],
            ExecMetric::Binary { left, right, .. } => vec![left.as_mut(), right.as_mut()],
            ExecMetric::Min(metrics) | ExecMetric::Max(metrics) => metrics.iter_mut().collect(),
            ExecMetric::IfThenElse { then, otherwise, .. } => vec![then.as_mut(), otherwise.as_mut()],
            _ => Vec::new(),
        }
    }
}

fn padded(values: &[f64], size: usize) -> Vec<f64> {
    (0..size).map(|g| values.get(g).copied().unwrap_or(0.0)).collect()
}

fn fold_all(
    metrics: &[ExecMetric],
    stats: &[Vec<f64>],
    num_groups: usize,
    combine: fn(f64, f64) -> f64,
) -> ExecutionResult<Vec<f64>> {
    let mut result: Option<Vec<f64>> = None;
    for metric in metrics {
        let values = metric.group_stats(stats, num_groups)?;
        result = Some(match result {
            None => values,
            Some(mut acc) => {
                for (a, v) in acc.iter_mut().zip(values) {
                    *a = combine(*a, v);
                }
                acc
            }
        });
    }
    Ok(result.unwrap_or_else(|| vec![0.0; num_groups + 1]))
}

fn fold_apply(
    metrics: &mut [ExecMetric],
    term: &Term,
    stats: &[f64],
    group: usize,
    combine: fn(f64, f64) -> f64,
) -> ExecutionResult<f64> {
    let mut result: Option<f64> = None;
    for metric in metrics {
        let value = metric.apply(term, stats, group)?;
        result = Some(result.map_or(value, |acc| combine(acc, value)));
    }
    Ok(result.unwrap_or(0.0))
}
