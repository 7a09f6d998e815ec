//! Constant folding
//!
//! Applied bottom-up through `transform`, so every rule sees children that are
//! already folded. Running the pass twice gives the same tree as running it
//! once.

use crate::language::plan::Query;
use crate::language::{AggregateFilter, AggregateMetric, ArithOp, CompareOp, DocFilter, DocMetric, Rewrite};
use crate::term::Term;

pub fn simplify(query: Query) -> Query {
    query.transform(&rewrite())
}

pub fn simplify_aggregate_metric(metric: AggregateMetric) -> AggregateMetric {
    metric.transform(&rewrite())
}

pub fn simplify_doc_filter(filter: DocFilter) -> DocFilter {
    filter.transform(&fold_doc_metric, &fold_doc_filter)
}

pub fn simplify_doc_metric(metric: DocMetric) -> DocMetric {
    metric.transform(&fold_doc_metric, &fold_doc_filter)
}

fn rewrite() -> Rewrite<'static> {
    Rewrite {
        aggregate_metric: &fold_aggregate_metric,
        doc_metric: &fold_doc_metric,
        aggregate_filter: &fold_aggregate_filter,
        doc_filter: &fold_doc_filter,
        ..Rewrite::identity()
    }
}

/// `Count` is one per document
fn doc_constant(metric: &DocMetric) -> Option<i64> {
    match metric {
        DocMetric::Count => Some(1),
        other => literal(other),
    }
}

/// Comparisons only fold literals. `count() > 5` is a metric filter the
/// engine evaluates, not a constant.
fn literal(metric: &DocMetric) -> Option<i64> {
    match metric {
        DocMetric::Constant(v) => Some(*v),
        _ => None,
    }
}

/// Put a literal operand first
fn normalize<'m>(left: &'m DocMetric, right: &'m DocMetric) -> (&'m DocMetric, &'m DocMetric) {
    if literal(left).is_none() && literal(right).is_some() {
        (right, left)
    } else {
        (left, right)
    }
}

fn zero_one(value: bool) -> DocMetric {
    DocMetric::Constant(value as i64)
}

fn fold_doc_metric(metric: DocMetric) -> DocMetric {
    match metric {
        DocMetric::Binary { op, left, right } => {
            match (op, doc_constant(&left), doc_constant(&right)) {
                (_, Some(l), Some(r)) => match op.apply(l, r) {
                    Some(v) => DocMetric::Constant(v),
                    None => DocMetric::Binary { op, left, right },
                },
                (ArithOp::Multiply, Some(0), _) | (ArithOp::Multiply, _, Some(0)) => DocMetric::Constant(0),
                (ArithOp::Multiply, Some(1), _) => *right,
                (ArithOp::Multiply, _, Some(1)) | (ArithOp::Subtract, _, Some(0)) | (ArithOp::Divide, _, Some(1)) => {
                    *left
                }
                _ => DocMetric::Binary { op, left, right },
            }
        }
        DocMetric::Negate(m) => match doc_constant(&m) {
            Some(v) => DocMetric::Constant(v.wrapping_neg()),
            None => DocMetric::Negate(m),
        },
        DocMetric::Abs(m) => match (doc_constant(&m), *m) {
            (Some(v), _) => DocMetric::Constant(v.wrapping_abs()),
            (None, inner @ DocMetric::Abs(_)) => inner,
            (None, inner) => DocMetric::Abs(Box::new(inner)),
        },
        DocMetric::Signum(m) => match doc_constant(&m) {
            Some(v) => DocMetric::Constant(v.signum()),
            None => DocMetric::Signum(m),
        },
        DocMetric::Log { metric, scale_factor } => match doc_constant(&metric) {
            Some(v) if v > 0 && scale_factor > 0 => {
                let scale = f64::from(scale_factor);
                DocMetric::Constant((((v as f64).ln() - scale.ln()) * scale) as i64)
            }
            _ => DocMetric::Log { metric, scale_factor },
        },
        DocMetric::Exponentiate { metric, scale_factor } => match doc_constant(&metric) {
            Some(v) if scale_factor > 0 => {
                let scale = f64::from(scale_factor);
                DocMetric::Constant(((v as f64 / scale).exp() * scale) as i64)
            }
            _ => DocMetric::Exponentiate { metric, scale_factor },
        },
        DocMetric::IfThenElse {
            condition,
            then,
            otherwise,
        } => match *condition {
            DocFilter::Always => *then,
            DocFilter::Never => *otherwise,
            _ if then == otherwise => *then,
            condition => DocMetric::IfThenElse {
                condition: Box::new(condition),
                then,
                otherwise,
            },
        },
        DocMetric::Compare { op, left, right } => fold_doc_compare(op, *left, *right),
        other => other,
    }
}

fn fold_doc_compare(op: CompareOp, left: DocMetric, right: DocMetric) -> DocMetric {
    if let (Some(l), Some(r)) = (literal(&left), literal(&right)) {
        return zero_one(op.apply_i64(l, r));
    }
    if matches!(op, CompareOp::Eq | CompareOp::Ne) {
        let is_eq = op == CompareOp::Eq;
        let (constant, other) = normalize(&left, &right);
        if let Some(c) = literal(constant) {
            match other {
                DocMetric::Field(field) => {
                    let has = DocMetric::HasInt {
                        field: field.clone(),
                        term: c,
                    };
                    return if is_eq {
                        has
                    } else {
                        DocMetric::subtract(DocMetric::Constant(1), has)
                    };
                }
                inner if inner.is_zero_one() => {
                    // Comparing a 0/1 metric against 1 keeps it, against 0 inverts it
                    let keep = if is_eq { c == 1 } else { c == 0 };
                    let invert = if is_eq { c == 0 } else { c == 1 };
                    if keep {
                        return inner.clone();
                    }
                    if invert {
                        if let Some(inverted) = inner.invert() {
                            return inverted;
                        }
                    } else {
                        return zero_one(!is_eq);
                    }
                }
                _ => {}
            }
        }
    }
    DocMetric::compare(op, left, right)
}

fn fold_doc_filter(filter: DocFilter) -> DocFilter {
    match filter {
        DocFilter::Compare { op, left, right } => fold_filter_compare(op, *left, *right),
        DocFilter::IntFieldIn { field, terms } if terms.len() == 1 => match terms.into_iter().next() {
            Some(term) => DocFilter::FieldIs {
                field,
                term: Term::int(term),
            },
            None => DocFilter::Never,
        },
        DocFilter::StringFieldIn { field, terms } if terms.len() == 1 => match terms.into_iter().next() {
            Some(term) => DocFilter::FieldIs {
                field,
                term: Term::string(term),
            },
            None => DocFilter::Never,
        },
        DocFilter::Not(inner) => fold_not(*inner),
        DocFilter::Between {
            field,
            lower,
            upper,
            is_upper_inclusive,
        } => {
            let unbounded_below = lower == i64::MIN;
            let unbounded_above = is_upper_inclusive && upper == i64::MAX;
            let metric = || DocMetric::Field(field.clone());
            if unbounded_below && unbounded_above {
                return DocFilter::Always;
            }
            if unbounded_below {
                let op = if is_upper_inclusive { CompareOp::Lte } else { CompareOp::Lt };
                return fold_filter_compare(op, metric(), DocMetric::Constant(upper));
            }
            if unbounded_above {
                return fold_filter_compare(CompareOp::Gte, metric(), DocMetric::Constant(lower));
            }
            let upper_inclusive = if is_upper_inclusive {
                upper
            } else if upper == i64::MIN {
                return DocFilter::Never;
            } else {
                upper - 1
            };
            if lower == upper_inclusive {
                return fold_filter_compare(CompareOp::Eq, metric(), DocMetric::Constant(lower));
            }
            DocFilter::Between {
                field,
                lower,
                upper,
                is_upper_inclusive,
            }
        }
        other => other,
    }
}

fn constant_filter(value: bool) -> DocFilter {
    if value {
        DocFilter::Always
    } else {
        DocFilter::Never
    }
}

fn fold_filter_compare(op: CompareOp, left: DocMetric, right: DocMetric) -> DocFilter {
    if let (Some(l), Some(r)) = (literal(&left), literal(&right)) {
        return constant_filter(op.apply_i64(l, r));
    }
    match op {
        CompareOp::Eq | CompareOp::Ne => {
            let is_eq = op == CompareOp::Eq;
            let (constant, other) = normalize(&left, &right);
            if let Some(c) = literal(constant) {
                if let Some(inner) = other.to_filter() {
                    return match (is_eq, c) {
                        (true, 1) | (false, 0) => inner,
                        (true, 0) | (false, 1) => fold_not(inner),
                        _ => constant_filter(!is_eq),
                    };
                }
                if let DocMetric::Field(field) = other {
                    let field = field.clone();
                    let term = Term::int(c);
                    return if is_eq {
                        DocFilter::FieldIs { field, term }
                    } else {
                        DocFilter::FieldIsnt { field, term }
                    };
                }
            }
        }
        CompareOp::Gt | CompareOp::Lte => {
            if literal(&right) == Some(i64::MAX) || literal(&left) == Some(i64::MIN) {
                return constant_filter(op == CompareOp::Lte);
            }
        }
        CompareOp::Lt | CompareOp::Gte => {
            if literal(&right) == Some(i64::MIN) || literal(&left) == Some(i64::MAX) {
                return constant_filter(op == CompareOp::Gte);
            }
        }
    }
    DocFilter::compare(op, left, right)
}

fn fold_not(inner: DocFilter) -> DocFilter {
    match inner {
        DocFilter::Always => DocFilter::Never,
        DocFilter::Never => DocFilter::Always,
        DocFilter::Compare { op, left, right } => fold_filter_compare(op.negate(), *left, *right),
        DocFilter::Not(filter) => *filter,
        DocFilter::Regex { field, pattern } => DocFilter::NotRegex { field, pattern },
        DocFilter::NotRegex { field, pattern } => DocFilter::Regex { field, pattern },
        DocFilter::FieldIs { field, term } => DocFilter::FieldIsnt { field, term },
        DocFilter::FieldIsnt { field, term } => DocFilter::FieldIs { field, term },
        other => DocFilter::not(other),
    }
}

fn fold_aggregate_metric(metric: AggregateMetric) -> AggregateMetric {
    use AggregateMetric::*;
    let unary = |m: &AggregateMetric, f: fn(f64) -> f64| match m {
        Constant(v) => Some(Constant(f(*v))),
        _ => None,
    };
    let folded = match &metric {
        Negate(m) => unary(m, |v| -v),
        Abs(m) => unary(m, f64::abs),
        Floor(m) => unary(m, f64::floor),
        Ceil(m) => unary(m, f64::ceil),
        Round(m) => unary(m, f64::round),
        Log(m) => match m.as_ref() {
            Constant(v) if *v > 0.0 => Some(Constant(v.ln())),
            _ => None,
        },
        Binary { op, left, right } => match (left.as_ref(), right.as_ref()) {
            (Constant(l), Constant(r)) => {
                let v = op.apply(*l, *r);
                v.is_finite().then_some(Constant(v))
            }
            _ => None,
        },
        _ => None,
    };
    folded.unwrap_or(metric)
}

fn fold_aggregate_filter(filter: AggregateFilter) -> AggregateFilter {
    match filter {
        AggregateFilter::Compare { op, left, right } => match (left.as_ref(), right.as_ref()) {
            (AggregateMetric::Constant(l), AggregateMetric::Constant(r)) => {
                if op.apply_f64(*l, *r) {
                    AggregateFilter::Always
                } else {
                    AggregateFilter::Never
                }
            }
            _ => AggregateFilter::Compare { op, left, right },
        },
        AggregateFilter::Not(inner) => match *inner {
            AggregateFilter::Always => AggregateFilter::Never,
            AggregateFilter::Never => AggregateFilter::Always,
            AggregateFilter::Not(filter) => *filter,
            other => AggregateFilter::not(other),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldSet;
    use crate::language::MathOp;

    fn clicks() -> DocMetric {
        DocMetric::Field(FieldSet::single("a", "clicks"))
    }

    fn country() -> FieldSet {
        FieldSet::single("a", "country")
    }

    fn samples() -> Vec<DocFilter> {
        vec![
            DocFilter::compare(CompareOp::Eq, clicks(), DocMetric::Constant(3)),
            DocFilter::not(DocFilter::compare(CompareOp::Gt, clicks(), DocMetric::Constant(3))),
            DocFilter::not(DocFilter::not(DocFilter::Regex {
                field: country(),
                pattern: "u.*".into(),
            })),
            DocFilter::and(vec![
                DocFilter::compare(CompareOp::Lt, DocMetric::Constant(1), DocMetric::Constant(2)),
                DocFilter::compare(
                    CompareOp::Eq,
                    DocMetric::compare(CompareOp::Gt, clicks(), DocMetric::Constant(1)),
                    DocMetric::Constant(0),
                ),
            ]),
            DocFilter::Between {
                field: country(),
                lower: 5,
                upper: 6,
                is_upper_inclusive: false,
            },
            DocFilter::IntFieldIn {
                field: country(),
                terms: [7].into_iter().collect(),
            },
        ]
    }

    #[test]
    fn test_filter_folding() {
        let folded: Vec<_> = samples().into_iter().map(simplify_doc_filter).collect();
        assert_eq!(
            folded[0],
            DocFilter::FieldIs {
                field: FieldSet::single("a", "clicks"),
                term: Term::int(3)
            }
        );
        assert_eq!(
            folded[1],
            DocFilter::compare(CompareOp::Lte, clicks(), DocMetric::Constant(3))
        );
        assert_eq!(
            folded[2],
            DocFilter::Regex {
                field: country(),
                pattern: "u.*".into()
            }
        );
        assert_eq!(
            folded[3],
            DocFilter::compare(CompareOp::Lte, clicks(), DocMetric::Constant(1))
        );
        assert_eq!(
            folded[4],
            DocFilter::FieldIs {
                field: country(),
                term: Term::int(5)
            }
        );
        assert_eq!(
            folded[5],
            DocFilter::FieldIs {
                field: country(),
                term: Term::int(7)
            }
        );
    }

    #[test]
    fn test_count_comparison_is_not_folded() {
        let filter = DocFilter::compare(CompareOp::Gt, DocMetric::Count, DocMetric::Constant(5));
        assert_eq!(simplify_doc_filter(filter.clone()), filter);
        let metric = DocMetric::compare(CompareOp::Eq, DocMetric::Count, DocMetric::Constant(1));
        assert_eq!(simplify_doc_metric(metric.clone()), metric);
        assert_eq!(
            simplify_doc_metric(DocMetric::binary(ArithOp::Multiply, DocMetric::Count, DocMetric::Constant(3))),
            DocMetric::Constant(3)
        );
    }

    #[test]
    fn test_unbounded_comparisons_fold_on_either_side() {
        let cases = [
            (CompareOp::Gt, clicks(), DocMetric::Constant(i64::MAX), DocFilter::Never),
            (CompareOp::Lte, clicks(), DocMetric::Constant(i64::MAX), DocFilter::Always),
            (CompareOp::Lt, DocMetric::Constant(i64::MAX), clicks(), DocFilter::Never),
            (CompareOp::Gte, DocMetric::Constant(i64::MAX), clicks(), DocFilter::Always),
            (CompareOp::Lt, clicks(), DocMetric::Constant(i64::MIN), DocFilter::Never),
            (CompareOp::Gte, clicks(), DocMetric::Constant(i64::MIN), DocFilter::Always),
            (CompareOp::Gt, DocMetric::Constant(i64::MIN), clicks(), DocFilter::Never),
            (CompareOp::Lte, DocMetric::Constant(i64::MIN), clicks(), DocFilter::Always),
        ];
        for (op, left, right, expected) in cases {
            assert_eq!(simplify_doc_filter(DocFilter::compare(op, left, right)), expected);
        }
    }

    #[test]
    fn test_simplify_is_idempotent() {
        for filter in samples() {
            let once = simplify_doc_filter(filter);
            assert_eq!(simplify_doc_filter(once.clone()), once);
        }
        let metric = DocMetric::add(vec![
            DocMetric::multiply(clicks(), DocMetric::Constant(1)),
            DocMetric::Abs(Box::new(DocMetric::Abs(Box::new(clicks())))),
            DocMetric::compare(CompareOp::Eq, DocMetric::Constant(4), clicks()),
        ]);
        let once = simplify_doc_metric(metric);
        assert_eq!(simplify_doc_metric(once.clone()), once);
    }

    #[test]
    fn test_metric_folding() {
        assert_eq!(
            simplify_doc_metric(DocMetric::binary(
                ArithOp::Multiply,
                DocMetric::Constant(6),
                DocMetric::Constant(7)
            )),
            DocMetric::Constant(42)
        );
        assert_eq!(
            simplify_doc_metric(DocMetric::multiply(clicks(), DocMetric::Constant(0))),
            DocMetric::Constant(0)
        );
        let divide_by_zero = DocMetric::binary(ArithOp::Divide, clicks(), DocMetric::Constant(0));
        assert_eq!(simplify_doc_metric(divide_by_zero.clone()), divide_by_zero);
        assert_eq!(
            simplify_doc_metric(DocMetric::compare(CompareOp::Eq, clicks(), DocMetric::Constant(4))),
            DocMetric::HasInt {
                field: FieldSet::single("a", "clicks"),
                term: 4
            }
        );
        assert_eq!(
            simplify_doc_metric(DocMetric::if_then_else(DocFilter::Always, clicks(), DocMetric::Count)),
            clicks()
        );
    }

    #[test]
    fn test_aggregate_folding() {
        let metric = AggregateMetric::binary(
            MathOp::Multiply,
            AggregateMetric::Negate(Box::new(AggregateMetric::Constant(2.0))),
            AggregateMetric::Constant(3.0),
        );
        assert_eq!(simplify_aggregate_metric(metric), AggregateMetric::Constant(-6.0));
        let divide_by_zero = AggregateMetric::divide(AggregateMetric::Constant(1.0), AggregateMetric::Constant(0.0));
        assert_eq!(simplify_aggregate_metric(divide_by_zero.clone()), divide_by_zero);
    }
}
