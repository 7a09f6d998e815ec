//! Dataset qualification of doc metrics
//!
//! `DocStats(m)` sums `m` over every dataset in scope. When `m` names a
//! single dataset through `ds.metric`, the sum is restricted to that dataset
//! and becomes one `DocStatsPushes` per dataset the engine must register.

use std::cell::RefCell;
use std::collections::BTreeSet;

use crate::language::{AggregateMetric, CompileError, CompileResult, DocFilter, DocMetric};

/// Datasets named by `Qualified` nodes anywhere in `metric`
pub fn doc_metric_qualifications(metric: &DocMetric) -> BTreeSet<String> {
    let found = RefCell::new(BTreeSet::new());
    metric.clone().transform(
        &|m| {
            if let DocMetric::Qualified { dataset, .. } = &m {
                found.borrow_mut().insert(dataset.clone());
            }
            m
        },
        &|f: DocFilter| f,
    );
    found.into_inner()
}

/// Sum of `metric` per dataset it applies to within `scope`
pub fn qualified_doc_stats(metric: DocMetric, scope: &BTreeSet<String>) -> CompileResult<AggregateMetric> {
    let qualifications = doc_metric_qualifications(&metric);
    let datasets: Vec<String> = match qualifications.len() {
        0 => scope.iter().cloned().collect(),
        1 => qualifications.into_iter().collect(),
        _ => {
            return Err(CompileError::Invalid(format!(
                "Doc Metric cannot have multiple different qualifications! metric = [{:?}], qualifications = [{:?}]",
                metric, qualifications
            )))
        }
    };
    let pushes = datasets
        .into_iter()
        .map(|dataset| AggregateMetric::DocStatsPushes {
            dataset,
            metric: metric.clone(),
        })
        .collect();
    Ok(AggregateMetric::add(pushes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldSet;

    fn scope() -> BTreeSet<String> {
        ["a".to_string(), "b".to_string()].into_iter().collect()
    }

    fn qualified(dataset: &str) -> DocMetric {
        DocMetric::Qualified {
            dataset: dataset.into(),
            metric: Box::new(DocMetric::Field(FieldSet::single(dataset, "clicks"))),
        }
    }

    #[test]
    fn test_unqualified_spans_scope() {
        let metric = qualified_doc_stats(DocMetric::Count, &scope()).unwrap();
        assert_eq!(metric.to_string(), "(a.[count()] + b.[count()])");
    }

    #[test]
    fn test_qualified_restricts_to_dataset() {
        let metric = DocMetric::add(vec![qualified("b"), DocMetric::Constant(2)]);
        assert_eq!(
            doc_metric_qualifications(&metric),
            ["b".to_string()].into_iter().collect()
        );
        match qualified_doc_stats(metric, &scope()).unwrap() {
            AggregateMetric::DocStatsPushes { dataset, .. } => assert_eq!(dataset, "b"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_qualifications() {
        let metric = DocMetric::add(vec![qualified("a"), qualified("b")]);
        assert!(matches!(
            qualified_doc_stats(metric, &scope()),
            Err(CompileError::Invalid(_))
        ));
    }
}
