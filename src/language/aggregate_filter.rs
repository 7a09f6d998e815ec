//! Group-level filters
//!
//! An [`AggregateFilter`] keeps or drops whole groups (HAVING clauses,
//! top-k filters, FILTER regroups). Term filters only apply while iterating
//! a field's terms.

use serde::ser::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::aggregate_metric::{AggregateMetric, Rewrite, Traversal};
use super::error::{CompileError, CompileResult};
use super::ops::CompareOp;
use super::validation::{validate_regex, ErrorCollector, ValidationHelper};
use crate::execution::{ExecFilter, GroupKeySet, NamedLookups};
use crate::fields::FieldSet;
use crate::term::Term;

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateFilter {
    /// Current term equals `term`
    TermIs(Term),
    /// Current term matches `pattern`
    TermRegex(String),
    Compare {
        op: CompareOp,
        left: Box<AggregateMetric>,
        right: Box<AggregateMetric>,
    },
    /// Built through [`AggregateFilter::and`]
    And(Vec<AggregateFilter>),
    /// Built through [`AggregateFilter::or`]
    Or(Vec<AggregateFilter>),
    Not(Box<AggregateFilter>),
    /// Current term of `field` matches `pattern`
    Regex {
        field: FieldSet,
        pattern: String,
    },
    Always,
    Never,
    IsDefaultGroup,
}

impl AggregateFilter {
    pub fn compare(op: CompareOp, left: AggregateMetric, right: AggregateMetric) -> AggregateFilter {
        AggregateFilter::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Conjunction that flattens nested conjunctions and drops `Always`
    pub fn and(filters: Vec<AggregateFilter>) -> AggregateFilter {
        let mut flat = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter {
                AggregateFilter::And(inner) => flat.extend(inner),
                AggregateFilter::Always => {}
                AggregateFilter::Never => return AggregateFilter::Never,
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => AggregateFilter::Always,
            1 => flat.remove(0),
            _ => AggregateFilter::And(flat),
        }
    }

    /// Disjunction that flattens nested disjunctions and drops `Never`
    pub fn or(filters: Vec<AggregateFilter>) -> AggregateFilter {
        let mut flat = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter {
                AggregateFilter::Or(inner) => flat.extend(inner),
                AggregateFilter::Never => {}
                AggregateFilter::Always => return AggregateFilter::Always,
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => AggregateFilter::Never,
            1 => flat.remove(0),
            _ => AggregateFilter::Or(flat),
        }
    }

    pub fn not(filter: AggregateFilter) -> AggregateFilter {
        AggregateFilter::Not(Box::new(filter))
    }

    pub fn is_ordered(&self) -> bool {
        match self {
            AggregateFilter::Compare { left, right, .. } => left.is_ordered() || right.is_ordered(),
            AggregateFilter::And(filters) | AggregateFilter::Or(filters) => {
                filters.iter().any(AggregateFilter::is_ordered)
            }
            AggregateFilter::Not(filter) => filter.is_ordered(),
            _ => false,
        }
    }

    pub fn requires_ftgs(&self) -> bool {
        match self {
            AggregateFilter::Compare { left, right, .. } => left.requires_ftgs() || right.requires_ftgs(),
            AggregateFilter::And(filters) | AggregateFilter::Or(filters) => {
                filters.iter().any(AggregateFilter::requires_ftgs)
            }
            AggregateFilter::Not(filter) => filter.requires_ftgs(),
            _ => false,
        }
    }

    /// Whether the filter inspects the current term
    pub fn is_term_filter(&self) -> bool {
        match self {
            AggregateFilter::TermIs(_) | AggregateFilter::TermRegex(_) | AggregateFilter::Regex { .. } => true,
            AggregateFilter::And(filters) | AggregateFilter::Or(filters) => {
                filters.iter().any(AggregateFilter::is_term_filter)
            }
            AggregateFilter::Not(filter) => filter.is_term_filter(),
            _ => false,
        }
    }

    pub fn transform(self, r: &Rewrite<'_>) -> AggregateFilter {
        let rebuilt = match self {
            AggregateFilter::Compare { op, left, right } => AggregateFilter::Compare {
                op,
                left: Box::new(left.transform(r)),
                right: Box::new(right.transform(r)),
            },
            AggregateFilter::And(filters) => {
                AggregateFilter::and(filters.into_iter().map(|f| f.transform(r)).collect())
            }
            AggregateFilter::Or(filters) => {
                AggregateFilter::or(filters.into_iter().map(|f| f.transform(r)).collect())
            }
            AggregateFilter::Not(filter) => AggregateFilter::Not(Box::new(filter.transform(r))),
            leaf => leaf,
        };
        (r.aggregate_filter)(rebuilt)
    }

    /// Apply `f` to every metric directly held by this filter tree
    pub fn traverse1(self, f: &mut Traversal<'_>) -> CompileResult<AggregateFilter> {
        Ok(match self {
            AggregateFilter::Compare { op, left, right } => {
                let left = Box::new(f(*left)?);
                let right = Box::new(f(*right)?);
                AggregateFilter::Compare { op, left, right }
            }
            AggregateFilter::And(filters) => AggregateFilter::and(
                filters
                    .into_iter()
                    .map(|x| x.traverse1(f))
                    .collect::<CompileResult<_>>()?,
            ),
            AggregateFilter::Or(filters) => AggregateFilter::or(
                filters
                    .into_iter()
                    .map(|x| x.traverse1(f))
                    .collect::<CompileResult<_>>()?,
            ),
            AggregateFilter::Not(filter) => AggregateFilter::Not(Box::new(filter.traverse1(f)?)),
            leaf => leaf,
        })
    }

    pub fn validate(
        &self,
        scope: &BTreeSet<String>,
        helper: &ValidationHelper,
        errors: &mut ErrorCollector,
    ) -> CompileResult<()> {
        match self {
            AggregateFilter::TermRegex(pattern) => {
                validate_regex(pattern, errors);
                Ok(())
            }
            AggregateFilter::Regex { field, pattern } => {
                validate_regex(pattern, errors);
                for dataset in scope {
                    let name = field.dataset_field_name(dataset)?;
                    helper.validate_field(dataset, name, &self.to_string(), errors);
                }
                Ok(())
            }
            AggregateFilter::Compare { op, left, right } => {
                if matches!(op, CompareOp::Eq | CompareOp::Ne) {
                    warn_constant_equality(self, left, right, errors);
                }
                left.validate(scope, helper, errors)?;
                right.validate(scope, helper, errors)
            }
            AggregateFilter::And(filters) | AggregateFilter::Or(filters) => {
                for filter in filters {
                    filter.validate(scope, helper, errors)?;
                }
                Ok(())
            }
            AggregateFilter::Not(filter) => filter.validate(scope, helper, errors),
            AggregateFilter::TermIs(_)
            | AggregateFilter::Always
            | AggregateFilter::Never
            | AggregateFilter::IsDefaultGroup => Ok(()),
        }
    }

    pub fn to_execution_filter(
        &self,
        lookups: &NamedLookups,
        keys: &Arc<GroupKeySet>,
    ) -> CompileResult<ExecFilter> {
        let fold = |filters: &[AggregateFilter],
                    combine: fn(Box<ExecFilter>, Box<ExecFilter>) -> ExecFilter,
                    empty: bool|
         -> CompileResult<ExecFilter> {
            let mut lowered = filters.iter().map(|f| f.to_execution_filter(lookups, keys));
            match lowered.next() {
                None => Ok(ExecFilter::Constant(empty)),
                Some(first) => lowered.try_fold(first?, |acc, next| Ok(combine(Box::new(acc), Box::new(next?)))),
            }
        };
        match self {
            AggregateFilter::TermIs(term) => Ok(ExecFilter::TermEquals(term.clone())),
            AggregateFilter::TermRegex(pattern) | AggregateFilter::Regex { pattern, .. } => {
                let compiled = regex::Regex::new(pattern)
                    .map_err(|e| CompileError::Invalid(format!("Invalid pattern: {} ({})", pattern, e)))?;
                Ok(ExecFilter::TermEqualsRegex(compiled))
            }
            AggregateFilter::Compare { op, left, right } => Ok(ExecFilter::compare(
                *op,
                left.to_execution_metric(lookups, keys)?,
                right.to_execution_metric(lookups, keys)?,
            )),
            AggregateFilter::And(filters) => fold(filters, ExecFilter::And, true),
            AggregateFilter::Or(filters) => fold(filters, ExecFilter::Or, false),
            AggregateFilter::Not(filter) => Ok(ExecFilter::Not(Box::new(
                filter.to_execution_filter(lookups, keys)?,
            ))),
            AggregateFilter::Always => Ok(ExecFilter::Constant(true)),
            AggregateFilter::Never => Ok(ExecFilter::Constant(false)),
            AggregateFilter::IsDefaultGroup => Ok(ExecFilter::IsDefaultGroup(Arc::clone(keys))),
        }
    }
}

fn is_summed_doc_stats(metric: &AggregateMetric) -> bool {
    match metric {
        AggregateMetric::Add(metrics) => metrics.iter().all(is_summed_doc_stats),
        AggregateMetric::DocStatsPushes { .. } => true,
        _ => false,
    }
}

/// Comparing a per-group sum to a nonzero integer usually means the author
/// wanted a per-document comparison.
fn warn_constant_equality(
    filter: &AggregateFilter,
    left: &AggregateMetric,
    right: &AggregateMetric,
    errors: &mut ErrorCollector,
) {
    let value = match (left, right) {
        (AggregateMetric::Constant(v), other) | (other, AggregateMetric::Constant(v))
            if is_summed_doc_stats(other) =>
        {
            *v
        }
        _ => return,
    };
    if value.fract() != 0.0 || value == 0.0 {
        return;
    }
    let direction = if value > 0.0 { ">" } else { "<" };
    errors.warn(format!(
        "Comparison of aggregate to constant \"{}\" is likely an error. \
         If there are multiple documents with value {}, the sum will be {}{}.",
        filter, value as i64, direction, value as i64
    ));
}

impl fmt::Display for AggregateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |filters: &[AggregateFilter], sep: &str| {
            filters.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(sep)
        };
        match self {
            AggregateFilter::TermIs(term) => write!(f, "term() = {}", term.as_string()),
            AggregateFilter::TermRegex(pattern) => write!(f, "term() =~ \"{}\"", pattern),
            AggregateFilter::Compare { op, left, right } => write!(f, "{} {} {}", left, op, right),
            AggregateFilter::And(filters) => write!(f, "({})", join(filters, " and ")),
            AggregateFilter::Or(filters) => write!(f, "({})", join(filters, " or ")),
            AggregateFilter::Not(filter) => write!(f, "not({})", filter),
            AggregateFilter::Regex { field, pattern } => write!(f, "{} =~ \"{}\"", field, pattern),
            AggregateFilter::Always => f.write_str("true"),
            AggregateFilter::Never => f.write_str("false"),
            AggregateFilter::IsDefaultGroup => f.write_str("is_default_group()"),
        }
    }
}

impl Serialize for AggregateFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::DocMetric;

    fn lookup(name: &str) -> AggregateMetric {
        AggregateMetric::GroupStatsLookup(name.to_string())
    }

    #[test]
    fn test_and_or_simplify() {
        assert_eq!(
            AggregateFilter::and(vec![AggregateFilter::Always, AggregateFilter::IsDefaultGroup]),
            AggregateFilter::IsDefaultGroup
        );
        assert_eq!(
            AggregateFilter::or(vec![AggregateFilter::IsDefaultGroup, AggregateFilter::Always]),
            AggregateFilter::Always
        );
        assert_eq!(AggregateFilter::and(vec![]), AggregateFilter::Always);
        assert_eq!(AggregateFilter::or(vec![]), AggregateFilter::Never);
    }

    #[test]
    fn test_or_lowers_elementwise() {
        let filter = AggregateFilter::or(vec![
            AggregateFilter::compare(CompareOp::Gt, lookup("a"), AggregateMetric::Constant(2.0)),
            AggregateFilter::compare(CompareOp::Eq, lookup("b"), AggregateMetric::Constant(1.0)),
        ]);
        let mut lookups = NamedLookups::new();
        lookups.insert("a", vec![0.0, 5.0, 1.0, 0.0]);
        lookups.insert("b", vec![0.0, 0.0, 1.0, 0.0]);
        let lowered = filter.to_execution_filter(&lookups, &GroupKeySet::root()).unwrap();
        assert_eq!(lowered.group_stats(&[], 3).unwrap(), vec![false, true, true, false]);
    }

    #[test]
    fn test_bad_regex_is_invalid() {
        let filter = AggregateFilter::TermRegex("(".into());
        let err = filter
            .to_execution_filter(&NamedLookups::new(), &GroupKeySet::root())
            .unwrap_err();
        assert!(matches!(err, CompileError::Invalid(_)));

        let mut errors = ErrorCollector::new();
        filter
            .validate(&BTreeSet::new(), &ValidationHelper::default(), &mut errors)
            .unwrap();
        assert!(errors.has_errors());
    }

    #[test]
    fn test_equality_with_summed_stats_warns() {
        let stats = AggregateMetric::DocStatsPushes {
            dataset: "js".into(),
            metric: DocMetric::Count,
        };
        let filter = AggregateFilter::compare(CompareOp::Eq, stats, AggregateMetric::Constant(10.0));
        let scope: BTreeSet<String> = ["js".to_string()].into_iter().collect();
        let mut errors = ErrorCollector::new();
        filter
            .validate(&scope, &ValidationHelper::default(), &mut errors)
            .unwrap();
        assert!(!errors.has_errors());
        assert_eq!(errors.warnings().len(), 1);
        assert!(errors.warnings()[0].contains("the sum will be >10"));
    }

    #[test]
    fn test_ordering_and_term_detection() {
        let window = AggregateMetric::Window {
            window: 2,
            metric: Box::new(lookup("a")),
        };
        let ordered = AggregateFilter::not(AggregateFilter::compare(CompareOp::Lt, window, AggregateMetric::Constant(1.0)));
        assert!(ordered.is_ordered());
        assert!(!ordered.is_term_filter());
        assert!(AggregateFilter::and(vec![AggregateFilter::TermIs(Term::int(3)), ordered]).is_term_filter());
    }
}
