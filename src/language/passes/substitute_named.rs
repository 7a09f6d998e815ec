//! `metric AS name` references
//!
//! A select written `SELECT count() AS c, c / 2` defines `c`; later
//! references parse as [`AggregateMetric::NeedsSubstitution`] and are replaced
//! by the defining expression. The `Named` wrapper itself is dropped.

use std::collections::BTreeMap;

use crate::language::plan::Query;
use crate::language::{AggregateMetric, CompileError, CompileResult};

pub fn substitute_named(query: Query) -> CompileResult<Query> {
    let mut named = BTreeMap::new();
    for select in &query.selects {
        if let AggregateMetric::Named { metric, name } = select {
            if named.insert(name.clone(), (**metric).clone()).is_some() {
                return Err(CompileError::Invalid(format!("Metric name defined twice: {}", name)));
            }
        }
    }
    let mut stack = Vec::new();
    query.traverse1(&mut |m| replace(m, &named, &mut stack))
}

fn replace(
    metric: AggregateMetric,
    named: &BTreeMap<String, AggregateMetric>,
    stack: &mut Vec<String>,
) -> CompileResult<AggregateMetric> {
    match metric {
        AggregateMetric::NeedsSubstitution(name) => {
            let definition = named
                .get(&name)
                .ok_or_else(|| CompileError::Invalid(format!("Unknown metric name: {}", name)))?;
            let cycle = stack.contains(&name);
            stack.push(name);
            if cycle {
                return Err(CompileError::Invalid(format!(
                    "Hit cycle when doing name replacement: [{}]",
                    stack.join(" -> ")
                )));
            }
            let replaced = replace(definition.clone(), named, stack);
            stack.pop();
            replaced
        }
        AggregateMetric::Named { metric, .. } => replace(*metric, named, stack),
        other => other.traverse1(&mut |m| replace(m, named, stack)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::plan::Dataset;
    use crate::language::{DocMetric, MathOp};

    fn query(selects: Vec<AggregateMetric>) -> Query {
        let mut query = Query::new(vec![Dataset::new("a")]);
        query.selects = selects;
        query
    }

    fn named(metric: AggregateMetric, name: &str) -> AggregateMetric {
        AggregateMetric::Named {
            metric: Box::new(metric),
            name: name.into(),
        }
    }

    fn reference(name: &str) -> AggregateMetric {
        AggregateMetric::NeedsSubstitution(name.into())
    }

    #[test]
    fn test_reference_is_replaced() {
        let count = AggregateMetric::DocStats(DocMetric::Count);
        let q = query(vec![
            named(count.clone(), "c"),
            AggregateMetric::binary(MathOp::Divide, reference("c"), AggregateMetric::Constant(2.0)),
        ]);
        let q = substitute_named(q).unwrap();
        assert_eq!(q.selects[0], count);
        assert_eq!(
            q.selects[1],
            AggregateMetric::binary(MathOp::Divide, count, AggregateMetric::Constant(2.0))
        );
    }

    #[test]
    fn test_nested_definitions() {
        let q = query(vec![
            named(AggregateMetric::Constant(1.0), "x"),
            named(AggregateMetric::add(vec![reference("x"), reference("x")]), "y"),
            reference("y"),
        ]);
        let q = substitute_named(q).unwrap();
        assert_eq!(q.selects[2], AggregateMetric::Constant(2.0));
    }

    #[test]
    fn test_cycle_is_reported() {
        let q = query(vec![named(reference("b"), "a"), named(reference("a"), "b")]);
        match substitute_named(q) {
            Err(CompileError::Invalid(message)) => {
                assert!(message.starts_with("Hit cycle when doing name replacement"));
                assert!(message.contains("b -> a -> b"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_name() {
        assert!(substitute_named(query(vec![reference("nope")])).is_err());
    }
}
