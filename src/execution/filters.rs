//! Execution-time group filters
//!
//! Filters evaluate to one boolean per group. Term filters only make sense
//! while iterating the terms of a field and fail in group-stats mode.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::group_keys::GroupKeySet;
use super::metrics::{ExecMetric, QualifiedPush};
use super::{ExecutionError, ExecutionResult};
use crate::language::CompareOp;
use crate::term::Term;

#[derive(Debug, Clone)]
pub enum ExecFilter {
    Constant(bool),
    Compare {
        op: CompareOp,
        left: ExecMetric,
        right: ExecMetric,
    },
    And(Box<ExecFilter>, Box<ExecFilter>),
    Or(Box<ExecFilter>, Box<ExecFilter>),
    Not(Box<ExecFilter>),
    /// Current term equals the given term
    TermEquals(Term),
    /// Current term matches the pattern
    TermEqualsRegex(Regex),
    IsDefaultGroup(Arc<GroupKeySet>),
}

impl ExecFilter {
    pub fn compare(op: CompareOp, left: ExecMetric, right: ExecMetric) -> ExecFilter {
        ExecFilter::Compare { op, left, right }
    }

    pub(crate) fn collect_requires(&self, required: &mut BTreeSet<QualifiedPush>) {
        match self {
            ExecFilter::Compare { left, right, .. } => {
                left.collect_requires(required);
                right.collect_requires(required);
            }
            ExecFilter::And(l, r) | ExecFilter::Or(l, r) => {
                l.collect_requires(required);
                r.collect_requires(required);
            }
            ExecFilter::Not(f) => f.collect_requires(required),
            _ => {}
        }
    }

    pub fn requires(&self) -> BTreeSet<QualifiedPush> {
        let mut required = BTreeSet::new();
        self.collect_requires(&mut required);
        required
    }

    pub fn register(&mut self, indexes: &BTreeMap<QualifiedPush, usize>) -> ExecutionResult<()> {
        match self {
            ExecFilter::Compare { left, right, .. } => {
                left.register(indexes)?;
                right.register(indexes)
            }
            ExecFilter::And(l, r) | ExecFilter::Or(l, r) => {
                l.register(indexes)?;
                r.register(indexes)
            }
            ExecFilter::Not(f) => f.register(indexes),
            _ => Ok(()),
        }
    }

    pub fn needs_sorted(&self) -> bool {
        match self {
            ExecFilter::Compare { left, right, .. } => left.needs_sorted() || right.needs_sorted(),
            ExecFilter::And(l, r) | ExecFilter::Or(l, r) => l.needs_sorted() || r.needs_sorted(),
            ExecFilter::Not(f) => f.needs_sorted(),
            _ => false,
        }
    }

    /// One flag per group, index 0 unused
    pub fn group_stats(&self, stats: &[Vec<f64>], num_groups: usize) -> ExecutionResult<Vec<bool>> {
        let size = num_groups + 1;
        match self {
            ExecFilter::Constant(value) => Ok(vec![*value; size]),
            ExecFilter::Compare { op, left, right } => {
                let l = left.group_stats(stats, num_groups)?;
                let r = right.group_stats(stats, num_groups)?;
                Ok(l.into_iter().zip(r).map(|(a, b)| op.apply_f64(a, b)).collect())
            }
            ExecFilter::And(l, r) => {
                let l = l.group_stats(stats, num_groups)?;
                let r = r.group_stats(stats, num_groups)?;
                Ok(l.into_iter().zip(r).map(|(a, b)| a && b).collect())
            }
            ExecFilter::Or(l, r) => {
                let l = l.group_stats(stats, num_groups)?;
                let r = r.group_stats(stats, num_groups)?;
                Ok(l.into_iter().zip(r).map(|(a, b)| a || b).collect())
            }
            ExecFilter::Not(f) => Ok(f.group_stats(stats, num_groups)?.into_iter().map(|v| !v).collect()),
            ExecFilter::TermEquals(_) | ExecFilter::TermEqualsRegex(_) => {
                Err(ExecutionError::IterationOnly("term filter"))
            }
            ExecFilter::IsDefaultGroup(keys) => Ok((0..size).map(|g| keys.is_default(g)).collect()),
        }
    }

    /// Whether `(term, group)` passes during term iteration
    pub fn allow(&mut self, term: &Term, stats: &[f64], group: usize) -> ExecutionResult<bool> {
        match self {
            ExecFilter::Constant(value) => Ok(*value),
            ExecFilter::Compare { op, left, right } => {
                let l = left.apply(term, stats, group)?;
                let r = right.apply(term, stats, group)?;
                Ok(op.apply_f64(l, r))
            }
            ExecFilter::And(l, r) => {
                let l = l.allow(term, stats, group)?;
                let r = r.allow(term, stats, group)?;
                Ok(l && r)
            }
            ExecFilter::Or(l, r) => {
                let l = l.allow(term, stats, group)?;
                let r = r.allow(term, stats, group)?;
                Ok(l || r)
            }
            ExecFilter::Not(f) => Ok(!f.allow(term, stats, group)?),
            ExecFilter::TermEquals(expected) => Ok(terms_equal(expected, term)),
            ExecFilter::TermEqualsRegex(pattern) => Ok(pattern.is_match(&term.as_string())),
            ExecFilter::IsDefaultGroup(keys) => Ok(keys.is_default(group)),
        }
    }
}

fn terms_equal(expected: &Term, actual: &Term) -> bool {
    match (expected.int_value(), actual.int_value()) {
        (Some(a), Some(b)) => a == b,
        _ => expected.as_string() == actual.as_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::group_keys::GroupKey;

    #[test]
    fn test_or_is_elementwise() {
        let filter = ExecFilter::Or(
            Box::new(ExecFilter::compare(
                CompareOp::Gt,
                ExecMetric::PerGroupConstant {
                    name: "v0".into(),
                    values: Arc::new(vec![0.0, 5.0, 1.0, 0.0]),
                },
                ExecMetric::Constant(2.0),
            )),
            Box::new(ExecFilter::compare(
                CompareOp::Eq,
                ExecMetric::PerGroupConstant {
                    name: "v1".into(),
                    values: Arc::new(vec![0.0, 0.0, 1.0, 0.0]),
                },
                ExecMetric::Constant(1.0),
            )),
        );
        assert_eq!(
            filter.group_stats(&[], 3).unwrap(),
            vec![false, true, true, false]
        );
    }

    #[test]
    fn test_term_filters_need_iteration() {
        let mut filter = ExecFilter::TermEquals(Term::term("007"));
        assert!(filter.group_stats(&[], 1).is_err());
        assert!(filter.allow(&Term::int(7), &[], 1).unwrap());
        assert!(!filter.allow(&Term::string("8"), &[], 1).unwrap());

        let mut regex = ExecFilter::TermEqualsRegex(Regex::new("^soft").unwrap());
        assert!(regex.allow(&Term::string("software"), &[], 1).unwrap());
    }

    #[test]
    fn test_is_default_group() {
        let keys = GroupKeySet::explode(
            &GroupKeySet::root(),
            vec![(1, GroupKey::Term(Term::string("us"))), (1, GroupKey::Default)],
        )
        .unwrap();
        let filter = ExecFilter::IsDefaultGroup(keys);
        assert_eq!(filter.group_stats(&[], 2).unwrap(), vec![false, false, true]);
    }
}
