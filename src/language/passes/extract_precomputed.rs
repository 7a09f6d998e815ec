//! Precompute extraction
//!
//! Metrics the engine cannot compute from plain per-group sums (`DISTINCT`,
//! `PERCENTILE`, `FIELD_MIN`, `SUM_ACROSS`, `PARENT`, ...) are replaced by a
//! [`AggregateMetric::GroupStatsLookup`] and scheduled as a separate
//! computation at the grouping depth where their value is needed.
//!
//! ```text
//! depth 0        depth 1                depth 2 (= number of group-bys)
//!   │ pre(0)       │ pre(1)               │ pre(2)
//!   ├─ group-by 0 ─┼─ group-by 1 ─────────┤
//!   │ post(0)      │ post(1)              └─ GetGroupStats
//!   │ having 0     │ having 1
//! ```
//!
//! Pre computations run before the group-by of their depth. Post computations
//! run right after it, so a `HAVING` filter can use them.

use std::cell::RefCell;
use std::collections::BTreeSet;

use crate::language::execution_step::ExecutionStep;
use crate::language::plan::{GroupByEntry, Query};
use crate::language::precomputed::Precomputed;
use crate::language::{
    internal, AggregateFilter, AggregateMetric, CompileError, CompileResult, DocMetric, GroupBy, Rewrite,
};

use super::extract_qualified::qualified_doc_stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Computation {
    pub phase: Phase,
    pub depth: usize,
    pub scope: BTreeSet<String>,
    pub precomputed: Precomputed,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub query: Query,
    /// In creation order
    pub computations: Vec<Computation>,
}

pub fn extract_precomputed(query: Query) -> CompileResult<Extracted> {
    let mut processor = Processor::new(query.scope());
    let Query {
        datasets,
        filter,
        group_bys,
        selects,
        format_strings,
        options,
        row_limit,
    } = query;

    let mut extracted_group_bys = Vec::with_capacity(group_bys.len());
    for (i, entry) in group_bys.into_iter().enumerate() {
        let depth = i as i32 + 1;
        processor.depth = depth;
        processor.start_depth = depth;
        processor.max_depth = depth;

        let having = match &entry.group_by {
            GroupBy::Field { filter, .. } => filter.as_ref(),
            _ => entry.filter.as_ref(),
        };
        if !having.map(AggregateFilter::requires_ftgs).unwrap_or(false) {
            extracted_group_bys.push(entry.traverse1(&mut |m| processor.apply(m))?);
            continue;
        }

        processor.phase = Phase::Post;
        let GroupByEntry {
            group_by,
            filter,
            alias,
        } = entry;
        let extracted = match group_by {
            GroupBy::Field {
                field,
                filter: Some(having),
                limit,
                metric,
                with_default,
            } => {
                let having = having.traverse1(&mut |m| processor.apply(m))?;
                let group_by = GroupBy::Field {
                    field,
                    filter: None,
                    limit,
                    metric,
                    with_default,
                }
                .traverse1(&mut |m| processor.apply(m))?;
                GroupByEntry {
                    group_by,
                    filter: Some(having),
                    alias,
                }
            }
            group_by => {
                let having = match filter {
                    Some(having) => Some(having.traverse1(&mut |m| processor.apply(m))?),
                    None => None,
                };
                GroupByEntry {
                    group_by: group_by.traverse1(&mut |m| processor.apply(m))?,
                    filter: having,
                    alias,
                }
            }
        };
        extracted_group_bys.push(extracted);
        processor.phase = Phase::Pre;
    }

    let depth = extracted_group_bys.len() as i32;
    processor.depth = depth;
    processor.start_depth = depth;
    processor.max_depth = depth + 1;
    let selects = selects
        .into_iter()
        .map(|select| processor.apply(select))
        .collect::<CompileResult<Vec<_>>>()?;

    tracing::debug!(computations = processor.computations.len(), "extracted precomputed metrics");
    Ok(Extracted {
        query: Query {
            datasets,
            filter,
            group_bys: extracted_group_bys,
            selects,
            format_strings,
            options,
            row_limit,
        },
        computations: processor.computations,
    })
}

/// Interleave computations with the grouping stages and finish with the
/// selected stats
pub fn query_steps(extracted: &Extracted) -> CompileResult<Vec<ExecutionStep>> {
    let query = &extracted.query;
    let scope = query.scope();

    let mut group_by_steps = Vec::with_capacity(query.group_bys.len());
    for entry in &query.group_bys {
        group_by_steps.push((
            entry.group_by.execution_step(&scope)?,
            entry.filter.clone().map(ExecutionStep::FilterGroups),
        ));
    }

    let max_depth = extracted
        .computations
        .iter()
        .map(|c| c.depth + 1)
        .chain(std::iter::once(group_by_steps.len()))
        .max()
        .unwrap_or(0);
    let computed_at = |phase: Phase, depth: usize| {
        extracted
            .computations
            .iter()
            .filter(move |c| c.phase == phase && c.depth == depth)
            .map(|c| ExecutionStep::ComputePrecomputed {
                scope: c.scope.clone(),
                computation: c.precomputed.clone(),
                name: c.name.clone(),
            })
    };

    let mut steps = Vec::new();
    let mut group_by_steps = group_by_steps.into_iter();
    for depth in 0..max_depth {
        steps.extend(computed_at(Phase::Pre, depth));
        let having = match group_by_steps.next() {
            Some((step, having)) => {
                steps.push(step);
                having
            }
            None => None,
        };
        steps.extend(computed_at(Phase::Post, depth));
        steps.extend(having);
    }
    steps.push(ExecutionStep::GetGroupStats {
        stats: query.selects.clone(),
        format_strings: query.format_strings.clone(),
    });
    Ok(steps)
}

struct Processor {
    depth: i32,
    start_depth: i32,
    max_depth: i32,
    scope: BTreeSet<String>,
    phase: Phase,
    next_name: usize,
    computations: Vec<Computation>,
}

impl Processor {
    fn new(scope: BTreeSet<String>) -> Self {
        Self {
            depth: 1,
            start_depth: 1,
            max_depth: 1,
            scope,
            phase: Phase::Pre,
            next_name: 0,
            computations: Vec::new(),
        }
    }

    fn apply(&mut self, metric: AggregateMetric) -> CompileResult<AggregateMetric> {
        match metric {
            AggregateMetric::Parent(metric) => {
                let depth = self.depth;
                self.depth -= 1;
                let result = self.apply(*metric);
                self.depth = depth;
                result
            }
            AggregateMetric::Distinct { field, filter, window } => {
                let filter = match filter {
                    Some(filter) => {
                        let (depth, start_depth) = (self.depth, self.start_depth);
                        self.depth = depth + 1;
                        self.start_depth = depth + 1;
                        let result = (*filter).traverse1(&mut |m| self.apply(m));
                        self.depth = depth;
                        self.start_depth = start_depth;
                        Some(result?)
                    }
                    None => None,
                };
                self.handle_precomputed(Precomputed::Distinct { field, filter, window })
            }
            AggregateMetric::Percentile { field, percentile } => {
                self.handle_precomputed(Precomputed::Percentile { field, percentile })
            }
            AggregateMetric::Qualified { datasets, metric } => {
                if !datasets.is_subset(&self.scope) {
                    return Err(CompileError::Invalid(format!(
                        "Cannot have a sub-scope that is not a subset of the outer scope. oldScope = [{:?}], newScope = [{:?}]",
                        self.scope, datasets
                    )));
                }
                let outer = std::mem::replace(&mut self.scope, datasets);
                let result = self.apply(*metric);
                self.scope = outer;
                result
            }
            AggregateMetric::DocStats(metric) => {
                if self.start_depth == self.depth {
                    qualified_doc_stats(metric, &self.scope)
                } else {
                    self.handle_precomputed(Precomputed::RawStats(metric))
                }
            }
            AggregateMetric::SumAcross { group_by, metric } => self.sum_across(*group_by, *metric),
            AggregateMetric::FieldMin { field, metric, filter } => {
                let metric = AggregateMetric::Negate(Box::new(average_by_default(metric, &field)));
                let metric = self.apply(metric)?;
                let filter = self.apply_filter(filter)?;
                self.handle_precomputed(Precomputed::FieldExtremeValue { field, metric, filter })
            }
            AggregateMetric::FieldMax { field, metric, filter } => {
                let metric = self.apply(average_by_default(metric, &field))?;
                let filter = self.apply_filter(filter)?;
                self.handle_precomputed(Precomputed::FieldExtremeValue { field, metric, filter })
            }
            AggregateMetric::Bootstrap {
                field,
                filter,
                seed,
                metric,
                num_bootstraps,
                varargs,
            } => {
                let metric = self.apply(*metric)?;
                let filter = self.apply_filter(filter)?;
                self.handle_precomputed(Precomputed::Bootstrap {
                    field,
                    filter,
                    seed,
                    metric,
                    num_bootstraps,
                    varargs,
                })
            }
            AggregateMetric::DivideByCount(metric) => {
                let metric = self.apply(*metric)?;
                let datasets = self.counted_datasets(&metric);
                if datasets.is_empty() {
                    return Err(CompileError::Invalid("Averaging over no documents is undefined".into()));
                }
                let count = datasets
                    .into_iter()
                    .map(|dataset| AggregateMetric::DocStatsPushes {
                        metric: DocMetric::Qualified {
                            dataset: dataset.clone(),
                            metric: Box::new(DocMetric::Count),
                        },
                        dataset,
                    })
                    .collect();
                Ok(AggregateMetric::divide(metric, AggregateMetric::add(count)))
            }
            other => other.traverse1(&mut |m| self.apply(m)),
        }
    }

    fn apply_filter(&mut self, filter: Option<Box<AggregateFilter>>) -> CompileResult<Option<AggregateFilter>> {
        filter.map(|f| (*f).traverse1(&mut |m| self.apply(m))).transpose()
    }

    fn sum_across(&mut self, group_by: GroupBy, metric: AggregateMetric) -> CompileResult<AggregateMetric> {
        if let GroupBy::Metric {
            exclude_gutters: false,
            ..
        } = group_by
        {
            return Err(CompileError::Invalid(
                "SUM_OVER(BUCKET(), metric) with gutters is very likely not what you want. It will sum over all documents."
                    .into(),
            ));
        }
        match group_by {
            GroupBy::Field {
                field,
                filter,
                limit: None,
                ..
            } => {
                let metric = self.apply(metric)?;
                let filter = self.apply_filter(filter.map(Box::new))?;
                self.handle_precomputed(Precomputed::SumAcross { field, metric, filter })
            }
            group_by if group_by.is_total() => {
                let group_by = group_by.traverse1(&mut |m| self.apply(m))?;
                let metric = self.apply(metric)?;
                self.handle_precomputed(Precomputed::SumAcrossGroupBy { group_by, metric })
            }
            group_by => {
                let total = group_by.make_total()?;
                if !total.is_total() {
                    return internal("groupBy.makeTotal() returned non-total GroupBy!");
                }
                let group_by = total.traverse1(&mut |m| self.apply(m))?;
                let metric = self.apply(AggregateMetric::if_then_else(
                    AggregateFilter::IsDefaultGroup,
                    AggregateMetric::Constant(0.0),
                    metric,
                ))?;
                self.handle_precomputed(Precomputed::SumAcrossGroupBy { group_by, metric })
            }
        }
    }

    /// Datasets whose documents a rewritten metric sums over
    fn counted_datasets(&self, metric: &AggregateMetric) -> BTreeSet<String> {
        let datasets = RefCell::new(BTreeSet::new());
        let visit = |m: AggregateMetric| {
            match &m {
                AggregateMetric::DocStatsPushes { dataset, .. } => {
                    datasets.borrow_mut().insert(dataset.clone());
                }
                AggregateMetric::GroupStatsLookup(name) => self.add_lookup_scope(&[name.clone()], &datasets),
                AggregateMetric::GroupStatsMultiLookup(names) => self.add_lookup_scope(names, &datasets),
                _ => {}
            }
            m
        };
        metric.clone().transform(&Rewrite::aggregate_metrics(&visit));
        datasets.into_inner()
    }

    fn add_lookup_scope(&self, names: &[String], datasets: &RefCell<BTreeSet<String>>) {
        for computation in &self.computations {
            let outputs = computation.precomputed.output_names(&computation.name);
            if names.iter().any(|n| outputs.contains(n)) {
                datasets.borrow_mut().extend(computation.scope.iter().cloned());
            }
        }
    }

    fn handle_precomputed(&mut self, precomputed: Precomputed) -> CompileResult<AggregateMetric> {
        let depth = match self.phase {
            Phase::Pre => self.depth,
            Phase::Post => self.depth - 1,
        };
        if depth < 0 {
            return Err(CompileError::Invalid(format!(
                "Depth reached negative when processing metric: {:?}",
                precomputed
            )));
        }
        if depth > self.max_depth {
            return internal(format!("Required computation in the future: {:?}", precomputed));
        }
        let depth = depth as usize;

        let existing = self.computations.iter().find(|c| {
            c.phase == self.phase && c.depth == depth && c.scope == self.scope && c.precomputed == precomputed
        });
        let name = match existing {
            Some(computation) => computation.name.clone(),
            None => {
                let name = format!("v{}", self.next_name);
                self.next_name += 1;
                self.computations.push(Computation {
                    phase: self.phase,
                    depth,
                    scope: self.scope.clone(),
                    precomputed: precomputed.clone(),
                    name: name.clone(),
                });
                name
            }
        };
        Ok(match precomputed {
            Precomputed::Bootstrap { .. } => AggregateMetric::GroupStatsMultiLookup(precomputed.output_names(&name)),
            _ => AggregateMetric::GroupStatsLookup(name),
        })
    }
}

/// Default `FIELD_MIN`/`FIELD_MAX` ordering: the field's average value
fn average_by_default(metric: Option<Box<AggregateMetric>>, field: &crate::fields::FieldSet) -> AggregateMetric {
    match metric {
        Some(metric) => *metric,
        None => AggregateMetric::DivideByCount(Box::new(AggregateMetric::add(
            field
                .datasets()
                .into_iter()
                .map(|dataset| AggregateMetric::DocStatsPushes {
                    dataset,
                    metric: DocMetric::Field(field.clone()),
                })
                .collect(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldSet;
    use crate::language::plan::Dataset;
    use crate::language::{CompareOp, MathOp};

    fn country() -> FieldSet {
        FieldSet::single("js", "country")
    }

    fn query() -> Query {
        Query::new(vec![Dataset::new("js")])
    }

    fn distinct() -> AggregateMetric {
        AggregateMetric::Distinct {
            field: country(),
            filter: None,
            window: None,
        }
    }

    fn count() -> AggregateMetric {
        AggregateMetric::DocStats(DocMetric::Count)
    }

    fn country_group_by() -> GroupByEntry {
        GroupByEntry::new(GroupBy::field(country(), None, None, None, false))
    }

    #[test]
    fn test_distinct_becomes_lookup() {
        let mut q = query();
        q.selects = vec![AggregateMetric::add(vec![distinct(), AggregateMetric::Constant(1.0)])];
        let extracted = extract_precomputed(q).unwrap();
        assert_eq!(
            extracted.query.selects[0],
            AggregateMetric::Add(vec![
                AggregateMetric::GroupStatsLookup("v0".into()),
                AggregateMetric::Constant(1.0)
            ])
        );
        let steps = query_steps(&extracted).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(matches!(
            &steps[0],
            ExecutionStep::ComputePrecomputed { name, computation: Precomputed::Distinct { .. }, .. } if name == "v0"
        ));
        assert!(matches!(&steps[1], ExecutionStep::GetGroupStats { .. }));
    }

    #[test]
    fn test_same_computation_shares_name() {
        let mut q = query();
        q.selects = vec![distinct(), distinct()];
        let extracted = extract_precomputed(q).unwrap();
        assert_eq!(extracted.computations.len(), 1);
        assert_eq!(extracted.query.selects[0], extracted.query.selects[1]);
    }

    #[test]
    fn test_doc_stats_become_pushes() {
        let mut q = query();
        q.selects = vec![count()];
        let extracted = extract_precomputed(q).unwrap();
        assert_eq!(
            extracted.query.selects[0],
            AggregateMetric::DocStatsPushes {
                dataset: "js".into(),
                metric: DocMetric::Count
            }
        );
        assert!(extracted.computations.is_empty());
    }

    #[test]
    fn test_parent_is_computed_before_last_group_by() {
        let mut q = query();
        q.group_bys = vec![country_group_by()];
        q.selects = vec![AggregateMetric::Parent(Box::new(count()))];
        let extracted = extract_precomputed(q).unwrap();
        assert_eq!(extracted.query.selects[0], AggregateMetric::GroupStatsLookup("v0".into()));
        let steps = query_steps(&extracted).unwrap();
        assert!(matches!(
            &steps[0],
            ExecutionStep::ComputePrecomputed {
                computation: Precomputed::RawStats(DocMetric::Count),
                ..
            }
        ));
        assert!(matches!(&steps[1], ExecutionStep::ExplodeAndRegroup { .. }));
        assert!(matches!(&steps[2], ExecutionStep::GetGroupStats { .. }));
    }

    #[test]
    fn test_parent_of_top_level_is_negative_depth() {
        let mut q = query();
        q.selects = vec![AggregateMetric::Parent(Box::new(AggregateMetric::Parent(Box::new(count()))))];
        assert!(matches!(extract_precomputed(q), Err(CompileError::Invalid(_))));
    }

    #[test]
    fn test_having_with_distinct_is_post_computed() {
        let mut q = query();
        let mut entry = GroupByEntry::new(GroupBy::DayOfWeek);
        entry.filter = Some(AggregateFilter::compare(
            CompareOp::Gt,
            distinct(),
            AggregateMetric::Constant(3.0),
        ));
        q.group_bys = vec![entry];
        let extracted = extract_precomputed(q).unwrap();
        assert_eq!(extracted.computations[0].phase, Phase::Post);
        assert_eq!(extracted.computations[0].depth, 0);
        let steps = query_steps(&extracted).unwrap();
        assert!(matches!(&steps[0], ExecutionStep::ExplodeDayOfWeek));
        assert!(matches!(&steps[1], ExecutionStep::ComputePrecomputed { .. }));
        assert!(matches!(&steps[2], ExecutionStep::FilterGroups(_)));
        assert!(matches!(&steps[3], ExecutionStep::GetGroupStats { .. }));
    }

    #[test]
    fn test_qualified_scope_must_be_subset() {
        let mut q = query();
        q.selects = vec![AggregateMetric::Qualified {
            datasets: ["other".to_string()].into_iter().collect(),
            metric: Box::new(count()),
        }];
        match extract_precomputed(q) {
            Err(CompileError::Invalid(message)) => assert!(message.starts_with("Cannot have a sub-scope")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sum_across_bucket_with_gutters_rejected() {
        let mut q = query();
        q.selects = vec![AggregateMetric::SumAcross {
            group_by: Box::new(GroupBy::Metric {
                metric: DocMetric::Count,
                min: 0,
                max: 10,
                interval: 1,
                exclude_gutters: false,
                with_default: false,
            }),
            metric: Box::new(count()),
        }];
        assert!(extract_precomputed(q).is_err());
    }

    #[test]
    fn test_sum_across_non_total_masks_default_group() {
        let mut q = query();
        q.selects = vec![AggregateMetric::SumAcross {
            group_by: Box::new(GroupBy::field(country(), None, Some(5), None, false)),
            metric: Box::new(count()),
        }];
        let extracted = extract_precomputed(q).unwrap();
        match &extracted.computations[0].precomputed {
            Precomputed::SumAcrossGroupBy { group_by, metric } => {
                assert!(group_by.is_total());
                assert!(matches!(metric, AggregateMetric::IfThenElse { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_field_max_defaults_to_average() {
        let mut q = query();
        q.selects = vec![AggregateMetric::FieldMax {
            field: country(),
            metric: None,
            filter: None,
        }];
        let extracted = extract_precomputed(q).unwrap();
        match &extracted.computations[0].precomputed {
            Precomputed::FieldExtremeValue { metric, .. } => match metric {
                AggregateMetric::Binary { op: MathOp::Divide, right, .. } => {
                    assert_eq!(right.to_string(), "js.[count()]");
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_average_over_nothing() {
        let mut q = query();
        q.selects = vec![AggregateMetric::DivideByCount(Box::new(AggregateMetric::Constant(1.0)))];
        assert!(extract_precomputed(q).is_err());
    }
}
