//! Document-level filters
//!
//! A [`DocFilter`] is a predicate over single documents. It lowers two ways:
//!
//! - [`DocFilter::as_zero_one_metric`]: a 0/1 [`DocMetric`] for arithmetic contexts
//! - [`DocFilter::get_execution_actions`]: regroup [`Action`]s that route the
//!   documents of group `target` to `positive` or `negative`
//!
//! Boolean combinators borrow scratch groups from a [`GroupSupplier`] so that
//! k filters lower to at most k + 2 actions, even when `target` coincides with
//! one of the destination groups.

use std::collections::{BTreeMap, BTreeSet};

use super::actions::{Action, DocQuery, QueryTerm};
use super::doc_metric::DocMetric;
use super::error::{CompileError, CompileResult};
use super::group_supplier::GroupSupplier;
use super::ops::CompareOp;
use super::passes::extract_qualified::doc_metric_qualifications;
use super::validation::{validate_regex, ErrorCollector, ValidationHelper};
use crate::fields::FieldSet;
use crate::term::Term;

/// Per-document predicate
#[derive(Debug, Clone, PartialEq)]
pub enum DocFilter {
    FieldIs {
        field: FieldSet,
        term: Term,
    },
    FieldIsnt {
        field: FieldSet,
        term: Term,
    },
    /// `lower <= field < upper`, or `<= upper` when inclusive
    Between {
        field: FieldSet,
        lower: i64,
        upper: i64,
        is_upper_inclusive: bool,
    },
    Compare {
        op: CompareOp,
        left: Box<DocMetric>,
        right: Box<DocMetric>,
    },
    /// Built through [`DocFilter::and`]
    And(Vec<DocFilter>),
    /// Built through [`DocFilter::or`]
    Or(Vec<DocFilter>),
    Not(Box<DocFilter>),
    Regex {
        field: FieldSet,
        pattern: String,
    },
    NotRegex {
        field: FieldSet,
        pattern: String,
    },
    FieldEqual {
        left: FieldSet,
        right: FieldSet,
    },
    /// Applies only to documents of the listed datasets
    Qualified {
        datasets: BTreeSet<String>,
        filter: Box<DocFilter>,
    },
    Lucene {
        query: String,
        per_dataset: BTreeMap<String, DocQuery>,
    },
    Sample {
        field: FieldSet,
        is_int_field: bool,
        numerator: u64,
        denominator: u64,
        seed: String,
    },
    SampleDocMetric {
        metric: Box<DocMetric>,
        numerator: u64,
        denominator: u64,
        seed: String,
    },
    StringFieldIn {
        field: FieldSet,
        terms: BTreeSet<String>,
    },
    IntFieldIn {
        field: FieldSet,
        terms: BTreeSet<i64>,
    },
    /// Membership in the terms returned by another query
    FieldInQuery {
        field: FieldSet,
        query: String,
        is_negated: bool,
    },
    Always,
    Never,
}

impl DocFilter {
    /// Conjunction that unwraps nested conjunctions and absorbs constants
    pub fn and(filters: Vec<DocFilter>) -> DocFilter {
        let mut kept = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter {
                DocFilter::And(inner) => kept.extend(inner),
                other => kept.push(other),
            }
        }
        if kept.iter().any(|f| matches!(f, DocFilter::Never)) {
            return DocFilter::Never;
        }
        kept.retain(|f| !matches!(f, DocFilter::Always));
        match kept.len() {
            0 => DocFilter::Always,
            1 => kept.remove(0),
            _ => DocFilter::And(kept),
        }
    }

    /// Disjunction that unwraps nested disjunctions and absorbs constants
    pub fn or(filters: Vec<DocFilter>) -> DocFilter {
        let mut kept = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter {
                DocFilter::Or(inner) => kept.extend(inner),
                other => kept.push(other),
            }
        }
        if kept.iter().any(|f| matches!(f, DocFilter::Always)) {
            return DocFilter::Always;
        }
        kept.retain(|f| !matches!(f, DocFilter::Never));
        match kept.len() {
            0 => DocFilter::Never,
            1 => kept.remove(0),
            _ => DocFilter::Or(kept),
        }
    }

    pub fn not(filter: DocFilter) -> DocFilter {
        DocFilter::Not(Box::new(filter))
    }

    pub fn compare(op: CompareOp, left: DocMetric, right: DocMetric) -> DocFilter {
        DocFilter::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `field = term`, normalising the term to the field's type.
    ///
    /// A term that cannot be an integer never matches an integer field.
    pub fn field_is(field: FieldSet, term: Term, is_int_field: bool) -> DocFilter {
        match normalize_term(term, is_int_field) {
            Some(term) => DocFilter::FieldIs { field, term },
            None => DocFilter::Never,
        }
    }

    /// `field != term`; a term that cannot be an integer differs from every
    /// value of an integer field.
    pub fn field_isnt(field: FieldSet, term: Term, is_int_field: bool) -> DocFilter {
        match normalize_term(term, is_int_field) {
            Some(term) => DocFilter::FieldIsnt { field, term },
            None => DocFilter::Always,
        }
    }

    /// Post-order rewrite: children first, then `i` on the rebuilt node.
    /// Nested metrics are rewritten with `g`.
    pub fn transform(
        self,
        g: &dyn Fn(DocMetric) -> DocMetric,
        i: &dyn Fn(DocFilter) -> DocFilter,
    ) -> DocFilter {
        let rebuilt = match self {
            DocFilter::Compare { op, left, right } => DocFilter::Compare {
                op,
                left: Box::new(left.transform(g, i)),
                right: Box::new(right.transform(g, i)),
            },
            DocFilter::And(filters) => {
                DocFilter::and(filters.into_iter().map(|f| f.transform(g, i)).collect())
            }
            DocFilter::Or(filters) => {
                DocFilter::or(filters.into_iter().map(|f| f.transform(g, i)).collect())
            }
            DocFilter::Not(filter) => DocFilter::Not(Box::new(filter.transform(g, i))),
            DocFilter::Qualified { datasets, filter } => DocFilter::Qualified {
                datasets,
                filter: Box::new(filter.transform(g, i)),
            },
            DocFilter::SampleDocMetric {
                metric,
                numerator,
                denominator,
                seed,
            } => DocFilter::SampleDocMetric {
                metric: Box::new(metric.transform(g, i)),
                numerator,
                denominator,
                seed,
            },
            leaf => leaf,
        };
        i(rebuilt)
    }

    /// 0/1 doc metric equivalent to this filter in `dataset`
    pub fn as_zero_one_metric(&self, dataset: &str) -> CompileResult<DocMetric> {
        match self {
            DocFilter::FieldIs { field, term } => Ok(match term {
                Term::Int { value, .. } => DocMetric::HasInt {
                    field: field.clone(),
                    term: *value,
                },
                Term::Str { value } => DocMetric::HasString {
                    field: field.clone(),
                    term: value.clone(),
                },
            }),
            DocFilter::FieldIsnt { field, term } => DocFilter::not(DocFilter::FieldIs {
                field: field.clone(),
                term: term.clone(),
            })
            .as_zero_one_metric(dataset),
            DocFilter::Between {
                field,
                lower,
                upper,
                is_upper_inclusive,
            } => {
                let value = DocMetric::Field(field.clone());
                let upper_op = if *is_upper_inclusive {
                    CompareOp::Lte
                } else {
                    CompareOp::Lt
                };
                DocFilter::and(vec![
                    DocFilter::compare(CompareOp::Gte, value.clone(), DocMetric::Constant(*lower)),
                    DocFilter::compare(upper_op, value, DocMetric::Constant(*upper)),
                ])
                .as_zero_one_metric(dataset)
            }
            DocFilter::Compare { op, left, right } => Ok(DocMetric::Compare {
                op: *op,
                left: left.clone(),
                right: right.clone(),
            }),
            DocFilter::And(filters) => {
                let sum = zero_one_sum(filters, dataset)?;
                Ok(DocMetric::compare(
                    CompareOp::Eq,
                    sum,
                    DocMetric::Constant(filters.len() as i64),
                ))
            }
            DocFilter::Or(filters) => {
                let sum = zero_one_sum(filters, dataset)?;
                Ok(DocMetric::compare(CompareOp::Gt, sum, DocMetric::Constant(0)))
            }
            DocFilter::Not(filter) => Ok(DocMetric::subtract(
                DocMetric::Constant(1),
                filter.as_zero_one_metric(dataset)?,
            )),
            DocFilter::Regex { field, pattern } => Ok(DocMetric::Regex {
                field: field.clone(),
                pattern: pattern.clone(),
            }),
            DocFilter::NotRegex { field, pattern } => DocFilter::not(DocFilter::Regex {
                field: field.clone(),
                pattern: pattern.clone(),
            })
            .as_zero_one_metric(dataset),
            DocFilter::FieldEqual { left, right } => Ok(DocMetric::FieldEqual {
                left: left.clone(),
                right: right.clone(),
            }),
            DocFilter::Qualified { datasets, filter } => {
                if datasets.contains(dataset) {
                    filter.as_zero_one_metric(dataset)
                } else {
                    Ok(DocMetric::Constant(1))
                }
            }
            DocFilter::Lucene { per_dataset, .. } => per_dataset
                .get(dataset)
                .ok_or_else(|| CompileError::UnknownDataset(dataset.to_string()))?
                .to_doc_filter(dataset)?
                .as_zero_one_metric(dataset),
            DocFilter::Sample { .. } | DocFilter::SampleDocMetric { .. } => Err(
                CompileError::Unsupported("Sample cannot be used as a metric".to_string()),
            ),
            DocFilter::StringFieldIn { field, terms } => DocFilter::or(
                terms
                    .iter()
                    .map(|t| DocFilter::FieldIs {
                        field: field.clone(),
                        term: Term::string(t.clone()),
                    })
                    .collect(),
            )
            .as_zero_one_metric(dataset),
            DocFilter::IntFieldIn { field, terms } => DocFilter::or(
                terms
                    .iter()
                    .map(|t| DocFilter::FieldIs {
                        field: field.clone(),
                        term: Term::int(*t),
                    })
                    .collect(),
            )
            .as_zero_one_metric(dataset),
            DocFilter::FieldInQuery { .. } => Err(CompileError::Unsupported(
                "FIELD IN (subquery) cannot be used as a metric".to_string(),
            )),
            DocFilter::Always => Ok(DocMetric::Constant(1)),
            DocFilter::Never => Ok(DocMetric::Constant(0)),
        }
    }

    /// Lower to actions routing documents of `target` to `positive` when the
    /// filter holds and to `negative` otherwise.
    pub fn get_execution_actions(
        &self,
        scope: &BTreeSet<String>,
        target: u32,
        positive: u32,
        negative: u32,
        groups: &mut GroupSupplier,
    ) -> CompileResult<Vec<Action>> {
        match self {
            DocFilter::FieldIs { field, term } => {
                check_scope(scope, field)?;
                let mut per_dataset_query = BTreeMap::new();
                for dataset in scope {
                    let name = field.dataset_field_name(dataset)?;
                    per_dataset_query.insert(
                        dataset.clone(),
                        DocQuery::term(QueryTerm::from_term(name, term)),
                    );
                }
                Ok(vec![Action::QueryAction {
                    scope: scope.clone(),
                    per_dataset_query,
                    target,
                    positive,
                    negative,
                }])
            }
            DocFilter::FieldIsnt { field, term } => DocFilter::not(DocFilter::FieldIs {
                field: field.clone(),
                term: term.clone(),
            })
            .get_execution_actions(scope, target, positive, negative, groups),
            DocFilter::Between {
                field,
                lower,
                upper,
                is_upper_inclusive,
            } => {
                check_scope(scope, field)?;
                let mut per_dataset_query = BTreeMap::new();
                for dataset in scope {
                    let name = field.dataset_field_name(dataset)?;
                    per_dataset_query.insert(
                        dataset.clone(),
                        DocQuery::int_range(name, *lower, *upper, *is_upper_inclusive),
                    );
                }
                Ok(vec![Action::QueryAction {
                    scope: scope.clone(),
                    per_dataset_query,
                    target,
                    positive,
                    negative,
                }])
            }
            DocFilter::Compare { left, right, .. } => {
                let mut qualifications = doc_metric_qualifications(left);
                qualifications.extend(doc_metric_qualifications(right));
                if qualifications.len() > 1 {
                    return Err(CompileError::Invalid(format!(
                        "DocFilter cannot have multiple different qualifications! qualifications = {:?}",
                        qualifications
                    )));
                }
                if !qualifications.is_subset(scope) {
                    return Err(CompileError::Invalid(format!(
                        "Scope does not contain qualifications! scope = {:?}, qualifications = {:?}",
                        scope, qualifications
                    )));
                }
                let action_scope = if qualifications.is_empty() {
                    scope.clone()
                } else {
                    qualifications
                };
                Ok(vec![self.metric_action(action_scope, target, positive, negative)?])
            }
            DocFilter::FieldEqual { .. } => {
                Ok(vec![self.metric_action(scope.clone(), target, positive, negative)?])
            }
            DocFilter::And(filters) => {
                and_actions(filters, scope, target, positive, negative, groups)
            }
            DocFilter::Or(filters) => or_actions(filters, scope, target, positive, negative, groups),
            DocFilter::Not(filter) => {
                filter.get_execution_actions(scope, target, negative, positive, groups)
            }
            DocFilter::Regex { field, pattern } => {
                check_scope(scope, field)?;
                Ok(vec![Action::RegexAction {
                    scope: scope.clone(),
                    field: field.clone(),
                    regex: pattern.clone(),
                    target,
                    positive,
                    negative,
                }])
            }
            DocFilter::NotRegex { field, pattern } => DocFilter::not(DocFilter::Regex {
                field: field.clone(),
                pattern: pattern.clone(),
            })
            .get_execution_actions(scope, target, positive, negative, groups),
            DocFilter::Qualified { datasets, filter } => {
                if !datasets.is_subset(scope) {
                    return Err(CompileError::Invalid(format!(
                        "Qualified scope not subset of outer scope! qualified = {:?}, scope = {:?}",
                        datasets, scope
                    )));
                }
                filter.get_execution_actions(datasets, target, positive, negative, groups)
            }
            DocFilter::Lucene { per_dataset, .. } => {
                let mut per_dataset_query = BTreeMap::new();
                for dataset in scope {
                    let query = per_dataset
                        .get(dataset)
                        .ok_or_else(|| CompileError::UnknownDataset(dataset.clone()))?;
                    per_dataset_query.insert(dataset.clone(), query.clone());
                }
                Ok(vec![Action::QueryAction {
                    scope: scope.clone(),
                    per_dataset_query,
                    target,
                    positive,
                    negative,
                }])
            }
            DocFilter::Sample {
                field,
                numerator,
                denominator,
                seed,
                ..
            } => {
                check_scope(scope, field)?;
                Ok(vec![Action::SampleAction {
                    scope: scope.clone(),
                    field: field.clone(),
                    probability: *numerator as f64 / *denominator as f64,
                    seed: seed.clone(),
                    target,
                    positive,
                    negative,
                }])
            }
            DocFilter::SampleDocMetric {
                metric,
                numerator,
                denominator,
                seed,
            } => {
                let mut per_dataset_metric = BTreeMap::new();
                for dataset in scope {
                    per_dataset_metric.insert(dataset.clone(), metric.get_pushes(dataset)?);
                }
                Ok(vec![Action::SampleMetricAction {
                    scope: scope.clone(),
                    per_dataset_metric,
                    probability: *numerator as f64 / *denominator as f64,
                    seed: seed.clone(),
                    target,
                    positive,
                    negative,
                }])
            }
            DocFilter::StringFieldIn { field, terms } => {
                check_scope(scope, field)?;
                Ok(vec![Action::StringOrAction {
                    scope: scope.clone(),
                    field: field.clone(),
                    terms: terms.clone(),
                    target,
                    positive,
                    negative,
                }])
            }
            DocFilter::IntFieldIn { field, terms } => {
                check_scope(scope, field)?;
                Ok(vec![Action::IntOrAction {
                    scope: scope.clone(),
                    field: field.clone(),
                    terms: terms.clone(),
                    target,
                    positive,
                    negative,
                }])
            }
            DocFilter::FieldInQuery {
                field,
                query,
                is_negated,
            } => Ok(vec![Action::FieldInQueryPlaceholderAction {
                scope: scope.clone(),
                field: field.clone(),
                query: query.clone(),
                is_negated: *is_negated,
                target,
                positive,
                negative,
            }]),
            DocFilter::Always => Ok(vec![Action::UnconditionalAction {
                scope: scope.clone(),
                target,
                new_group: positive,
            }]),
            DocFilter::Never => Ok(vec![Action::UnconditionalAction {
                scope: scope.clone(),
                target,
                new_group: negative,
            }]),
        }
    }

    fn metric_action(
        &self,
        scope: BTreeSet<String>,
        target: u32,
        positive: u32,
        negative: u32,
    ) -> CompileResult<Action> {
        let mut per_dataset_filter = BTreeMap::new();
        for dataset in &scope {
            let pushes = self.as_zero_one_metric(dataset)?.get_pushes(dataset)?;
            per_dataset_filter.insert(dataset.clone(), pushes);
        }
        Ok(Action::MetricAction {
            scope,
            per_dataset_filter,
            target,
            positive,
            negative,
        })
    }

    /// Check field existence and types against `dataset`
    pub fn validate(&self, dataset: &str, helper: &ValidationHelper, errors: &mut ErrorCollector) {
        let context = || format!("{:?}", self);
        let field_name = |field: &FieldSet, errors: &mut ErrorCollector| -> Option<String> {
            match field.dataset_field_name(dataset) {
                Ok(name) => Some(name.to_string()),
                Err(e) => {
                    errors.error(e.to_string());
                    None
                }
            }
        };
        match self {
            DocFilter::FieldIs { field, term } | DocFilter::FieldIsnt { field, term } => {
                if let Some(name) = field_name(field, errors) {
                    if term.is_int_term() {
                        helper.validate_field(dataset, &name, &context(), errors);
                    } else {
                        helper.validate_string_field(dataset, &name, &context(), errors);
                    }
                }
            }
            DocFilter::Between { field, .. } | DocFilter::IntFieldIn { field, .. } => {
                if let Some(name) = field_name(field, errors) {
                    helper.validate_int_field(dataset, &name, &context(), errors);
                }
            }
            DocFilter::StringFieldIn { field, .. } | DocFilter::FieldInQuery { field, .. } => {
                if let Some(name) = field_name(field, errors) {
                    helper.validate_field(dataset, &name, &context(), errors);
                }
            }
            DocFilter::Compare { left, right, .. } => {
                left.validate(dataset, helper, errors);
                right.validate(dataset, helper, errors);
            }
            DocFilter::And(filters) | DocFilter::Or(filters) => {
                for filter in filters {
                    filter.validate(dataset, helper, errors);
                }
            }
            DocFilter::Not(filter) => filter.validate(dataset, helper, errors),
            DocFilter::Regex { field, pattern } | DocFilter::NotRegex { field, pattern } => {
                if let Some(name) = field_name(field, errors) {
                    helper.validate_field(dataset, &name, &context(), errors);
                }
                validate_regex(pattern, errors);
            }
            DocFilter::FieldEqual { left, right } => {
                let left_name = field_name(left, errors);
                let right_name = field_name(right, errors);
                if let (Some(l), Some(r)) = (left_name, right_name) {
                    helper.validate_field(dataset, &l, &context(), errors);
                    helper.validate_field(dataset, &r, &context(), errors);
                    let both_int = helper.contains_int_field(dataset, &l)
                        && helper.contains_int_field(dataset, &r);
                    let both_string = helper.contains_string_field(dataset, &l)
                        && helper.contains_string_field(dataset, &r);
                    if helper.contains_field(dataset, &l)
                        && helper.contains_field(dataset, &r)
                        && !both_int
                        && !both_string
                    {
                        errors.error(format!(
                            "Incompatible fields found in fieldequal: [{}], [{}]",
                            l, r
                        ));
                    }
                }
            }
            DocFilter::Qualified { datasets, filter } => {
                if datasets.contains(dataset) {
                    filter.validate(dataset, helper, errors);
                }
            }
            DocFilter::Lucene { per_dataset, .. } => match per_dataset.get(dataset) {
                Some(query) => query.validate(dataset, helper, errors),
                None => errors.error(format!("Unknown dataset: {}", dataset)),
            },
            DocFilter::Sample {
                field,
                is_int_field,
                denominator,
                ..
            } => {
                if *denominator == 0 {
                    errors.error("Sample denominator must be positive");
                }
                if let Some(name) = field_name(field, errors) {
                    if *is_int_field {
                        helper.validate_int_field(dataset, &name, &context(), errors);
                    } else {
                        helper.validate_string_field(dataset, &name, &context(), errors);
                    }
                }
            }
            DocFilter::SampleDocMetric {
                metric, denominator, ..
            } => {
                if *denominator == 0 {
                    errors.error("Sample denominator must be positive");
                }
                metric.validate(dataset, helper, errors);
            }
            DocFilter::Always | DocFilter::Never => {}
        }
    }
}

fn normalize_term(term: Term, is_int_field: bool) -> Option<Term> {
    if is_int_field {
        if term.is_int_term() {
            Some(term)
        } else {
            term.int_value().map(Term::int)
        }
    } else if term.is_int_term() {
        Some(term.to_string_term())
    } else {
        Some(term)
    }
}

fn check_scope(scope: &BTreeSet<String>, field: &FieldSet) -> CompileResult<()> {
    if scope.iter().all(|d| field.contains_dataset(d)) {
        Ok(())
    } else {
        Err(CompileError::Invalid(format!(
            "Field {} is not defined for every dataset in scope {:?}",
            field, scope
        )))
    }
}

fn zero_one_sum(filters: &[DocFilter], dataset: &str) -> CompileResult<DocMetric> {
    let metrics = filters
        .iter()
        .map(|f| f.as_zero_one_metric(dataset))
        .collect::<CompileResult<Vec<_>>>()?;
    Ok(DocMetric::add(metrics))
}

fn and_actions(
    filters: &[DocFilter],
    scope: &BTreeSet<String>,
    target: u32,
    positive: u32,
    negative: u32,
    groups: &mut GroupSupplier,
) -> CompileResult<Vec<Action>> {
    let Some((last, init)) = filters.split_last() else {
        return DocFilter::Always.get_execution_actions(scope, target, positive, negative, groups);
    };
    let mut actions = Vec::new();
    if target != negative && positive != negative {
        for filter in init {
            actions.extend(filter.get_execution_actions(scope, target, target, negative, groups)?);
        }
        actions.extend(last.get_execution_actions(scope, target, positive, negative, groups)?);
    } else {
        let scratch = groups.acquire();
        for filter in filters {
            actions.extend(filter.get_execution_actions(scope, target, target, scratch, groups)?);
        }
        actions.push(Action::UnconditionalAction {
            scope: scope.clone(),
            target,
            new_group: positive,
        });
        actions.push(Action::UnconditionalAction {
            scope: scope.clone(),
            target: scratch,
            new_group: negative,
        });
        groups.release(scratch);
    }
    Ok(actions)
}

fn or_actions(
    filters: &[DocFilter],
    scope: &BTreeSet<String>,
    target: u32,
    positive: u32,
    negative: u32,
    groups: &mut GroupSupplier,
) -> CompileResult<Vec<Action>> {
    let Some((last, init)) = filters.split_last() else {
        return DocFilter::Never.get_execution_actions(scope, target, positive, negative, groups);
    };
    let mut actions = Vec::new();
    if target != positive && positive != negative {
        for filter in init {
            actions.extend(filter.get_execution_actions(scope, target, positive, target, groups)?);
        }
        actions.extend(last.get_execution_actions(scope, target, positive, negative, groups)?);
    } else {
        let scratch = groups.acquire();
        for filter in filters {
            actions.extend(filter.get_execution_actions(scope, target, scratch, target, groups)?);
        }
        actions.push(Action::UnconditionalAction {
            scope: scope.clone(),
            target,
            new_group: negative,
        });
        actions.push(Action::UnconditionalAction {
            scope: scope.clone(),
            target: scratch,
            new_group: positive,
        });
        groups.release(scratch);
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scope() -> BTreeSet<String> {
        ["js".to_string()].into_iter().collect()
    }

    fn country(value: &str) -> DocFilter {
        DocFilter::FieldIs {
            field: FieldSet::single("js", "country"),
            term: Term::string(value),
        }
    }

    fn clicks_gt(n: i64) -> DocFilter {
        DocFilter::compare(
            CompareOp::Gt,
            DocMetric::Field(FieldSet::single("js", "clicks")),
            DocMetric::Constant(n),
        )
    }

    /// Simulates the routing of one document through a list of actions,
    /// given which leaf predicates it satisfies.
    fn route(actions: &[Action], start: u32, matches: &dyn Fn(&Action) -> bool) -> u32 {
        let mut group = start;
        for action in actions {
            group = match action {
                Action::UnconditionalAction {
                    target, new_group, ..
                } if *target == group => *new_group,
                Action::UnconditionalAction { .. } => group,
                Action::QueryAction {
                    target,
                    positive,
                    negative,
                    ..
                }
                | Action::MetricAction {
                    target,
                    positive,
                    negative,
                    ..
                } if *target == group => {
                    if matches(action) {
                        *positive
                    } else {
                        *negative
                    }
                }
                _ => group,
            };
        }
        group
    }

    fn query_value(action: &Action) -> Option<String> {
        match action {
            Action::QueryAction {
                per_dataset_query, ..
            } => match &per_dataset_query["js"] {
                DocQuery::Term { start_term } => start_term.string_term.clone(),
                _ => None,
            },
            _ => None,
        }
    }

    #[test]
    fn test_and_or_absorption() {
        let f = country("us");
        assert_eq!(DocFilter::and(vec![DocFilter::Always, f.clone()]), f);
        assert_eq!(DocFilter::and(vec![DocFilter::Never, f.clone()]), DocFilter::Never);
        assert_eq!(DocFilter::or(vec![DocFilter::Never, f.clone()]), f);
        assert_eq!(DocFilter::or(vec![DocFilter::Always, f]), DocFilter::Always);
        assert_eq!(DocFilter::and(vec![]), DocFilter::Always);
        assert_eq!(DocFilter::or(vec![]), DocFilter::Never);
    }

    #[test]
    fn test_and_flattens() {
        let nested = DocFilter::and(vec![
            DocFilter::and(vec![country("a"), country("b")]),
            country("c"),
        ]);
        assert_eq!(
            nested,
            DocFilter::And(vec![country("a"), country("b"), country("c")])
        );
    }

    #[test]
    fn test_simple_filter_compiles_to_two_actions() {
        let filter = DocFilter::and(vec![country("x"), clicks_gt(5)]);
        let mut groups = GroupSupplier::new(2);
        let actions = filter
            .get_execution_actions(&scope(), 1, 1, 0, &mut groups)
            .unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions[0],
            Action::QueryAction {
                target: 1,
                positive: 1,
                negative: 0,
                ..
            }
        ));
        match &actions[1] {
            Action::MetricAction {
                per_dataset_filter,
                target: 1,
                positive: 1,
                negative: 0,
                ..
            } => assert_eq!(per_dataset_filter["js"], vec!["clicks", "5", ">"]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(groups.outstanding(), 0);
    }

    #[test]
    fn test_action_count_bound() {
        for k in 1..8 {
            let leaves: Vec<DocFilter> = (0..k).map(|i| country(&i.to_string())).collect();
            for filter in [DocFilter::and(leaves.clone()), DocFilter::or(leaves.clone())] {
                for (t, p, n) in [(1, 2, 3), (1, 1, 0), (1, 0, 1), (1, 2, 1)] {
                    let mut groups = GroupSupplier::new(10);
                    let actions = filter
                        .get_execution_actions(&scope(), t, p, n, &mut groups)
                        .unwrap();
                    assert!(actions.len() <= k + 2, "{} actions for {} leaves", actions.len(), k);
                    assert_eq!(groups.outstanding(), 0);
                }
            }
        }
    }

    #[test]
    fn test_routing_semantics_with_aliasing() {
        let filter = DocFilter::and(vec![country("a"), DocFilter::or(vec![country("b"), country("c")])]);
        let truth: HashMap<&str, bool> = [("a", true), ("b", false), ("c", true)].into_iter().collect();
        let expected = true;
        let matches = |a: &Action| query_value(a).map(|v| truth[v.as_str()]).unwrap_or(false);

        for (t, p, n) in [(1, 2, 3), (1, 1, 0), (1, 0, 1), (1, 2, 1)] {
            let mut groups = GroupSupplier::new(10);
            let actions = filter
                .get_execution_actions(&scope(), t, p, n, &mut groups)
                .unwrap();
            let end = route(&actions, t, &matches);
            assert_eq!(end, if expected { p } else { n }, "triple ({}, {}, {})", t, p, n);
        }
    }

    #[test]
    fn test_double_negation_routes_like_original() {
        let f = country("a");
        let double = DocFilter::not(DocFilter::not(f.clone()));
        for doc_matches in [true, false] {
            let matches = move |_: &Action| doc_matches;
            let mut groups = GroupSupplier::new(10);
            let plain = f.get_execution_actions(&scope(), 1, 2, 3, &mut groups).unwrap();
            let negated = double.get_execution_actions(&scope(), 1, 2, 3, &mut groups).unwrap();
            assert_eq!(route(&plain, 1, &matches), route(&negated, 1, &matches));
        }
    }

    #[test]
    fn test_empty_or_moves_to_negative() {
        let mut groups = GroupSupplier::new(2);
        let actions = DocFilter::Or(vec![])
            .get_execution_actions(&scope(), 1, 1, 0, &mut groups)
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::UnconditionalAction {
                scope: scope(),
                target: 1,
                new_group: 0
            }]
        );
    }

    #[test]
    fn test_field_is_int_field_with_string_term() {
        let field = FieldSet::single("js", "clicks");
        assert_eq!(
            DocFilter::field_is(field.clone(), Term::string("abc"), true),
            DocFilter::Never
        );
        assert_eq!(
            DocFilter::field_isnt(field.clone(), Term::string("abc"), true),
            DocFilter::Always
        );
        assert_eq!(
            DocFilter::field_is(field.clone(), Term::string("12"), true),
            DocFilter::FieldIs {
                field: field.clone(),
                term: Term::int(12)
            }
        );
        assert_eq!(
            DocFilter::field_isnt(field.clone(), Term::string("12"), true),
            DocFilter::FieldIsnt {
                field,
                term: Term::int(12)
            }
        );
    }

    #[test]
    fn test_field_is_string_field_keeps_literal() {
        let field = FieldSet::single("js", "zip");
        assert_eq!(
            DocFilter::field_is(field.clone(), Term::term("007"), false),
            DocFilter::FieldIs {
                field,
                term: Term::string("007")
            }
        );
    }

    #[test]
    fn test_zero_one_metrics() {
        let or = DocFilter::or(vec![country("a"), country("b")]);
        assert_eq!(
            or.as_zero_one_metric("js").unwrap().get_pushes("js").unwrap(),
            vec!["hasstr country:a", "hasstr country:b", "+", "0", ">"]
        );
        let not = DocFilter::not(country("a"));
        assert_eq!(
            not.as_zero_one_metric("js").unwrap().get_pushes("js").unwrap(),
            vec!["1", "hasstr country:a", "-"]
        );
        let qualified = DocFilter::Qualified {
            datasets: ["other".to_string()].into_iter().collect(),
            filter: Box::new(country("a")),
        };
        assert_eq!(qualified.as_zero_one_metric("js").unwrap(), DocMetric::Constant(1));
        assert!(DocFilter::Sample {
            field: FieldSet::single("js", "country"),
            is_int_field: false,
            numerator: 1,
            denominator: 2,
            seed: "s".into(),
        }
        .as_zero_one_metric("js")
        .is_err());
    }

    #[test]
    fn test_qualified_metric_filter_scope() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), "clicks".to_string());
        map.insert("b".to_string(), "clicks".to_string());
        let filter = DocFilter::compare(
            CompareOp::Gt,
            DocMetric::Qualified {
                dataset: "a".to_string(),
                metric: Box::new(DocMetric::Field(FieldSet::new(map))),
            },
            DocMetric::Constant(0),
        );
        let full: BTreeSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
        let mut groups = GroupSupplier::new(2);
        let actions = filter.get_execution_actions(&full, 1, 1, 0, &mut groups).unwrap();
        match &actions[0] {
            Action::MetricAction { scope, .. } => {
                assert_eq!(scope.iter().collect::<Vec<_>>(), vec!["a"])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validate_string_term_on_int_field() {
        let mut map = BTreeMap::new();
        map.insert(
            "js".to_string(),
            crate::catalog::DatasetMetadata::new("js").with_int_fields(&["clicks"]),
        );
        let helper = ValidationHelper::new(map);
        let mut errors = ErrorCollector::new();
        DocFilter::FieldIs {
            field: FieldSet::single("js", "clicks"),
            term: Term::string("x"),
        }
        .validate("js", &helper, &mut errors);
        assert!(errors.has_errors());
    }
}
