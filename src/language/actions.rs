//! Regroup actions
//!
//! An [`Action`] tells the grouping engine to move the documents currently in
//! group `target` to `positive` or `negative` depending on a predicate. Doc
//! filters lower to lists of actions; see
//! [`DocFilter::get_execution_actions`](super::DocFilter::get_execution_actions).
//!
//! # Wire format
//!
//! ```text
//! {"action":"queryAction","scope":["js"],"perDatasetQuery":{...},"target":1,"positive":1,"negative":0}
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::doc_filter::DocFilter;
use super::error::{CompileError, CompileResult};
use super::validation::{ErrorCollector, ValidationHelper};
use crate::fields::FieldSet;
use crate::term::Term;

/// One side of a term or range query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTerm {
    pub field: String,
    pub is_int_field: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub int_term: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_term: Option<String>,
}

impl QueryTerm {
    pub fn int(field: &str, value: i64) -> Self {
        Self {
            field: field.to_string(),
            is_int_field: true,
            int_term: Some(value),
            string_term: None,
        }
    }

    pub fn string(field: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            is_int_field: false,
            int_term: None,
            string_term: Some(value.to_string()),
        }
    }

    pub fn from_term(field: &str, term: &Term) -> Self {
        match term {
            Term::Int { value, .. } => Self::int(field, *value),
            Term::Str { value } => Self::string(field, value),
        }
    }

    fn to_term(&self) -> Term {
        match (&self.int_term, &self.string_term) {
            (Some(v), _) if self.is_int_field => Term::int(*v),
            (_, Some(s)) => Term::string(s.clone()),
            (Some(v), None) => Term::int(*v),
            (None, None) => Term::string(""),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BooleanOp {
    And,
    Or,
    Not,
}

/// Index-level query executed by the grouping engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DocQuery {
    #[serde(rename_all = "camelCase")]
    Term { start_term: QueryTerm },
    #[serde(rename_all = "camelCase")]
    Boolean {
        operator: BooleanOp,
        operands: Vec<DocQuery>,
    },
    #[serde(rename_all = "camelCase")]
    Range {
        start_term: QueryTerm,
        end_term: QueryTerm,
        is_max_inclusive: bool,
    },
}

impl DocQuery {
    pub fn term(term: QueryTerm) -> Self {
        DocQuery::Term { start_term: term }
    }

    pub fn boolean(operator: BooleanOp, operands: Vec<DocQuery>) -> Self {
        DocQuery::Boolean { operator, operands }
    }

    pub fn int_range(field: &str, lower: i64, upper: i64, is_max_inclusive: bool) -> Self {
        DocQuery::Range {
            start_term: QueryTerm::int(field, lower),
            end_term: QueryTerm::int(field, upper),
            is_max_inclusive,
        }
    }

    /// Fields referenced, with their intended type
    pub fn fields(&self) -> Vec<(&str, bool)> {
        match self {
            DocQuery::Term { start_term } => vec![(start_term.field.as_str(), start_term.is_int_field)],
            DocQuery::Boolean { operands, .. } => operands.iter().flat_map(|q| q.fields()).collect(),
            DocQuery::Range { start_term, .. } => {
                vec![(start_term.field.as_str(), start_term.is_int_field)]
            }
        }
    }

    pub fn validate(&self, dataset: &str, helper: &ValidationHelper, errors: &mut ErrorCollector) {
        for (field, is_int) in self.fields() {
            if is_int {
                helper.validate_int_field(dataset, field, "lucene query", errors);
            } else {
                helper.validate_string_field(dataset, field, "lucene query", errors);
            }
        }
    }

    /// Equivalent doc filter inside `dataset`
    pub fn to_doc_filter(&self, dataset: &str) -> CompileResult<DocFilter> {
        match self {
            DocQuery::Term { start_term } => Ok(DocFilter::FieldIs {
                field: FieldSet::single(dataset, start_term.field.as_str()),
                term: start_term.to_term(),
            }),
            DocQuery::Boolean { operator, operands } => {
                let filters = operands
                    .iter()
                    .map(|q| q.to_doc_filter(dataset))
                    .collect::<CompileResult<Vec<_>>>()?;
                match operator {
                    BooleanOp::And => Ok(DocFilter::and(filters)),
                    BooleanOp::Or => Ok(DocFilter::or(filters)),
                    BooleanOp::Not => Ok(DocFilter::not(DocFilter::and(filters))),
                }
            }
            DocQuery::Range {
                start_term,
                end_term,
                is_max_inclusive,
            } => match (start_term.int_term, end_term.int_term) {
                (Some(lower), Some(upper)) if start_term.is_int_field => Ok(DocFilter::Between {
                    field: FieldSet::single(dataset, start_term.field.as_str()),
                    lower,
                    upper,
                    is_upper_inclusive: *is_max_inclusive,
                }),
                _ => Err(CompileError::Unsupported(format!(
                    "String range over field {} cannot be used as a metric",
                    start_term.field
                ))),
            },
        }
    }
}

/// Document regroup instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Action {
    #[serde(rename_all = "camelCase")]
    QueryAction {
        scope: BTreeSet<String>,
        per_dataset_query: BTreeMap<String, DocQuery>,
        target: u32,
        positive: u32,
        negative: u32,
    },
    /// Filter evaluated as a 0/1 doc metric per dataset
    #[serde(rename_all = "camelCase")]
    MetricAction {
        scope: BTreeSet<String>,
        per_dataset_filter: BTreeMap<String, Vec<String>>,
        target: u32,
        positive: u32,
        negative: u32,
    },
    #[serde(rename_all = "camelCase")]
    RegexAction {
        scope: BTreeSet<String>,
        field: FieldSet,
        regex: String,
        target: u32,
        positive: u32,
        negative: u32,
    },
    #[serde(rename_all = "camelCase")]
    IntOrAction {
        scope: BTreeSet<String>,
        field: FieldSet,
        terms: BTreeSet<i64>,
        target: u32,
        positive: u32,
        negative: u32,
    },
    #[serde(rename_all = "camelCase")]
    StringOrAction {
        scope: BTreeSet<String>,
        field: FieldSet,
        terms: BTreeSet<String>,
        target: u32,
        positive: u32,
        negative: u32,
    },
    #[serde(rename_all = "camelCase")]
    SampleAction {
        scope: BTreeSet<String>,
        field: FieldSet,
        probability: f64,
        seed: String,
        target: u32,
        positive: u32,
        negative: u32,
    },
    #[serde(rename_all = "camelCase")]
    SampleMetricAction {
        scope: BTreeSet<String>,
        per_dataset_metric: BTreeMap<String, Vec<String>>,
        probability: f64,
        seed: String,
        target: u32,
        positive: u32,
        negative: u32,
    },
    /// Move everything in `target` to `new_group`
    #[serde(rename_all = "camelCase")]
    UnconditionalAction {
        scope: BTreeSet<String>,
        target: u32,
        new_group: u32,
    },
    /// Stands in for a membership test against a subquery's result
    #[serde(rename_all = "camelCase")]
    FieldInQueryPlaceholderAction {
        scope: BTreeSet<String>,
        field: FieldSet,
        query: String,
        is_negated: bool,
        target: u32,
        positive: u32,
        negative: u32,
    },
}

impl Action {
    /// Check the fields an action reads in each dataset of its scope
    pub fn validate(&self, helper: &ValidationHelper, errors: &mut ErrorCollector) -> CompileResult<()> {
        match self {
            Action::QueryAction {
                per_dataset_query, ..
            } => {
                for (dataset, query) in per_dataset_query {
                    query.validate(dataset, helper, errors);
                }
            }
            Action::RegexAction { scope, field, .. }
            | Action::SampleAction { scope, field, .. }
            | Action::FieldInQueryPlaceholderAction { scope, field, .. } => {
                for dataset in scope {
                    helper.validate_field(dataset, field.dataset_field_name(dataset)?, "filter", errors);
                }
            }
            Action::IntOrAction { scope, field, .. } => {
                for dataset in scope {
                    helper.validate_int_field(dataset, field.dataset_field_name(dataset)?, "filter", errors);
                }
            }
            Action::StringOrAction { scope, field, .. } => {
                for dataset in scope {
                    helper.validate_string_field(dataset, field.dataset_field_name(dataset)?, "filter", errors);
                }
            }
            Action::MetricAction { .. }
            | Action::SampleMetricAction { .. }
            | Action::UnconditionalAction { .. } => {}
        }
        Ok(())
    }
}

/// Merge runs of query actions that can be answered by one combined query.
///
/// Two adjacent query actions over the same scope and groups merge with OR
/// when `target == negative` (either query keeps the document) and with AND
/// when `target == positive`.
pub fn optimize_consecutive_query_actions(actions: Vec<Action>) -> Vec<Action> {
    let mut result = Vec::with_capacity(actions.len());
    let mut pending: Option<Action> = None;

    for action in actions {
        pending = match (pending.take(), action) {
            (
                Some(Action::QueryAction {
                    scope,
                    per_dataset_query,
                    target,
                    positive,
                    negative,
                }),
                Action::QueryAction {
                    scope: next_scope,
                    per_dataset_query: next_queries,
                    target: next_target,
                    positive: next_positive,
                    negative: next_negative,
                },
            ) if scope == next_scope
                && target == next_target
                && positive == next_positive
                && negative == next_negative
                && (target == negative || target == positive) =>
            {
                let operator = if target == negative {
                    BooleanOp::Or
                } else {
                    BooleanOp::And
                };
                let mut merged = BTreeMap::new();
                for (dataset, query) in per_dataset_query {
                    match next_queries.get(&dataset) {
                        Some(other) => {
                            merged.insert(
                                dataset,
                                DocQuery::boolean(operator, vec![query, other.clone()]),
                            );
                        }
                        None => {
                            merged.insert(dataset, query);
                        }
                    }
                }
                Some(Action::QueryAction {
                    scope,
                    per_dataset_query: merged,
                    target,
                    positive,
                    negative,
                })
            }
            (previous, action @ Action::QueryAction { .. }) => {
                result.extend(previous);
                Some(action)
            }
            (previous, action) => {
                result.extend(previous);
                result.push(action);
                None
            }
        };
    }
    result.extend(pending);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> BTreeSet<String> {
        ["js".to_string()].into_iter().collect()
    }

    fn term_action(value: &str, target: u32, positive: u32, negative: u32) -> Action {
        let mut queries = BTreeMap::new();
        queries.insert(
            "js".to_string(),
            DocQuery::term(QueryTerm::string("country", value)),
        );
        Action::QueryAction {
            scope: scope(),
            per_dataset_query: queries,
            target,
            positive,
            negative,
        }
    }

    #[test]
    fn test_query_action_json() {
        let json = serde_json::to_value(term_action("us", 1, 1, 0)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "action": "queryAction",
                "scope": ["js"],
                "perDatasetQuery": {"js": {"type": "TERM", "startTerm": {
                    "field": "country", "isIntField": false, "stringTerm": "us"}}},
                "target": 1, "positive": 1, "negative": 0
            })
        );
    }

    #[test]
    fn test_unconditional_json() {
        let json = serde_json::to_value(Action::UnconditionalAction {
            scope: scope(),
            target: 2,
            new_group: 1,
        })
        .unwrap();
        assert_eq!(json["action"], "unconditionalAction");
        assert_eq!(json["newGroup"], 1);
    }

    #[test]
    fn test_merge_and_chain() {
        let actions = vec![term_action("us", 1, 1, 0), term_action("gb", 1, 1, 0)];
        let merged = optimize_consecutive_query_actions(actions);
        assert_eq!(merged.len(), 1);
        match &merged[0] {
            Action::QueryAction {
                per_dataset_query, ..
            } => assert!(matches!(
                per_dataset_query["js"],
                DocQuery::Boolean {
                    operator: BooleanOp::And,
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_merge_or_chain() {
        let actions = vec![term_action("us", 1, 2, 1), term_action("gb", 1, 2, 1)];
        let merged = optimize_consecutive_query_actions(actions);
        assert_eq!(merged.len(), 1);
        match &merged[0] {
            Action::QueryAction {
                per_dataset_query, ..
            } => assert!(matches!(
                per_dataset_query["js"],
                DocQuery::Boolean {
                    operator: BooleanOp::Or,
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_merge_positive_chain_uses_and() {
        let actions = vec![term_action("us", 1, 1, 2), term_action("gb", 1, 1, 2)];
        let merged = optimize_consecutive_query_actions(actions);
        match &merged[0] {
            Action::QueryAction {
                per_dataset_query, ..
            } => assert!(matches!(
                per_dataset_query["js"],
                DocQuery::Boolean {
                    operator: BooleanOp::And,
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_merge_across_other_actions() {
        let actions = vec![
            term_action("us", 1, 2, 0),
            term_action("gb", 1, 2, 0),
            Action::UnconditionalAction {
                scope: scope(),
                target: 1,
                new_group: 0,
            },
            term_action("fr", 1, 1, 0),
        ];
        let merged = optimize_consecutive_query_actions(actions.clone());
        assert_eq!(merged, actions);
    }

    #[test]
    fn test_range_to_filter() {
        let filter = DocQuery::int_range("clicks", 1, 5, false)
            .to_doc_filter("js")
            .unwrap();
        assert_eq!(
            filter,
            DocFilter::Between {
                field: FieldSet::single("js", "clicks"),
                lower: 1,
                upper: 5,
                is_upper_inclusive: false,
            }
        );
    }
}
