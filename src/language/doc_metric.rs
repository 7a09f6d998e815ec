//! Document-level metrics
//!
//! A [`DocMetric`] computes one integer per document. The grouping engine
//! evaluates it as a postfix program of "pushes", produced per dataset by
//! [`DocMetric::get_pushes`].
//!
//! ```text
//! clicks + 2 * impressions   =>   clicks 2 impressions * +
//! ```

use base64::Engine;
use std::collections::BTreeMap;

use super::actions::DocQuery;
use super::doc_filter::DocFilter;
use super::error::{CompileError, CompileResult};
use super::ops::{ArithOp, CompareOp};
use super::validation::{missing_field, validate_regex, ErrorCollector, ValidationHelper};
use crate::fields::FieldSet;

/// Per-document integer expression
#[derive(Debug, Clone, PartialEq)]
pub enum DocMetric {
    Field(FieldSet),
    Constant(i64),
    /// One per document
    Count,
    DocId,
    Log {
        metric: Box<DocMetric>,
        scale_factor: i32,
    },
    Exponentiate {
        metric: Box<DocMetric>,
        scale_factor: i32,
    },
    Negate(Box<DocMetric>),
    Abs(Box<DocMetric>),
    Signum(Box<DocMetric>),
    /// Built through [`DocMetric::add`]
    Add(Vec<DocMetric>),
    /// Built through [`DocMetric::min`]
    Min(Vec<DocMetric>),
    /// Built through [`DocMetric::max`]
    Max(Vec<DocMetric>),
    Binary {
        op: ArithOp,
        left: Box<DocMetric>,
        right: Box<DocMetric>,
    },
    /// 1 when the comparison holds, else 0
    Compare {
        op: CompareOp,
        left: Box<DocMetric>,
        right: Box<DocMetric>,
    },
    IfThenElse {
        condition: Box<DocFilter>,
        then: Box<DocMetric>,
        otherwise: Box<DocMetric>,
    },
    Regex {
        field: FieldSet,
        pattern: String,
    },
    Extract {
        field: FieldSet,
        pattern: String,
        group_number: u32,
    },
    HasInt {
        field: FieldSet,
        term: i64,
    },
    HasString {
        field: FieldSet,
        term: String,
    },
    HasIntField(FieldSet),
    HasStringField(FieldSet),
    FieldEqual {
        left: FieldSet,
        right: FieldSet,
    },
    FloatScale {
        field: FieldSet,
        mult: f64,
        add: f64,
    },
    StringLen(FieldSet),
    IntTermCount(FieldSet),
    StrTermCount(FieldSet),
    /// Embedded sub-query, already resolved per dataset
    Lucene {
        query: String,
        per_dataset: BTreeMap<String, DocQuery>,
    },
    /// Only meaningful inside one dataset
    Qualified {
        dataset: String,
        metric: Box<DocMetric>,
    },
    PerDataset(BTreeMap<String, DocMetric>),
    Sample {
        field: FieldSet,
        is_int_field: bool,
        numerator: u64,
        denominator: u64,
        salt: String,
    },
    SampleMetric {
        metric: Box<DocMetric>,
        numerator: u64,
        denominator: u64,
        salt: String,
    },
    /// Hash bucket in `1..=max`
    Random {
        field: FieldSet,
        is_int_field: bool,
        max: u32,
        salt: String,
    },
    RandomMetric {
        metric: Box<DocMetric>,
        max: u32,
        salt: String,
    },
}

impl DocMetric {
    pub fn field(field: FieldSet) -> Self {
        DocMetric::Field(field)
    }

    pub fn constant(value: i64) -> Self {
        DocMetric::Constant(value)
    }

    /// Sum that flattens nested sums and folds constant terms
    pub fn add(metrics: Vec<DocMetric>) -> DocMetric {
        let mut terms = Vec::with_capacity(metrics.len());
        let mut constant: i64 = 0;
        for metric in flatten(metrics, |m| match m {
            DocMetric::Add(inner) => Ok(inner),
            other => Err(other),
        }) {
            match metric {
                DocMetric::Constant(v) => constant = constant.wrapping_add(v),
                DocMetric::Count => constant = constant.wrapping_add(1),
                other => terms.push(other),
            }
        }
        if constant != 0 {
            terms.push(DocMetric::Constant(constant));
        }
        match terms.len() {
            0 => DocMetric::Constant(0),
            1 => terms.remove(0),
            _ => DocMetric::Add(terms),
        }
    }

    /// Minimum; an empty list yields `Constant(0)`
    pub fn min(metrics: Vec<DocMetric>) -> DocMetric {
        extremum(metrics, true)
    }

    /// Maximum; an empty list yields `Constant(0)`
    pub fn max(metrics: Vec<DocMetric>) -> DocMetric {
        extremum(metrics, false)
    }

    pub fn binary(op: ArithOp, left: DocMetric, right: DocMetric) -> DocMetric {
        DocMetric::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn subtract(left: DocMetric, right: DocMetric) -> DocMetric {
        Self::binary(ArithOp::Subtract, left, right)
    }

    pub fn multiply(left: DocMetric, right: DocMetric) -> DocMetric {
        Self::binary(ArithOp::Multiply, left, right)
    }

    pub fn compare(op: CompareOp, left: DocMetric, right: DocMetric) -> DocMetric {
        DocMetric::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn if_then_else(condition: DocFilter, then: DocMetric, otherwise: DocMetric) -> DocMetric {
        DocMetric::IfThenElse {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    /// Whether this metric is a 0/1 comparison that has a filter form
    pub fn is_zero_one(&self) -> bool {
        matches!(self, DocMetric::Compare { .. })
    }

    /// Filter equivalent of a comparison metric
    pub fn to_filter(&self) -> Option<DocFilter> {
        match self {
            DocMetric::Compare { op, left, right } => Some(DocFilter::compare(
                *op,
                (**left).clone(),
                (**right).clone(),
            )),
            _ => None,
        }
    }

    /// Logical inverse of a comparison metric
    pub fn invert(&self) -> Option<DocMetric> {
        match self {
            DocMetric::Compare { op, left, right } => Some(DocMetric::Compare {
                op: op.negate(),
                left: left.clone(),
                right: right.clone(),
            }),
            _ => None,
        }
    }

    /// Post-order rewrite: children first, then `g` on the rebuilt node.
    /// Nested filters are rewritten with `i`.
    pub fn transform(
        self,
        g: &dyn Fn(DocMetric) -> DocMetric,
        i: &dyn Fn(DocFilter) -> DocFilter,
    ) -> DocMetric {
        let boxed = |m: Box<DocMetric>| Box::new(m.transform(g, i));
        let rebuilt = match self {
            DocMetric::Log {
                metric,
                scale_factor,
            } => DocMetric::Log {
                metric: boxed(metric),
                scale_factor,
            },
            DocMetric::Exponentiate {
                metric,
                scale_factor,
            } => DocMetric::Exponentiate {
                metric: boxed(metric),
                scale_factor,
            },
            DocMetric::Negate(m) => DocMetric::Negate(boxed(m)),
            DocMetric::Abs(m) => DocMetric::Abs(boxed(m)),
            DocMetric::Signum(m) => DocMetric::Signum(boxed(m)),
            DocMetric::Add(ms) => DocMetric::add(transform_all(ms, g, i)),
            DocMetric::Min(ms) => DocMetric::min(transform_all(ms, g, i)),
            DocMetric::Max(ms) => DocMetric::max(transform_all(ms, g, i)),
            DocMetric::Binary { op, left, right } => DocMetric::Binary {
                op,
                left: boxed(left),
                right: boxed(right),
            },
            DocMetric::Compare { op, left, right } => DocMetric::Compare {
                op,
                left: boxed(left),
                right: boxed(right),
            },
            DocMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => DocMetric::IfThenElse {
                condition: Box::new(condition.transform(g, i)),
                then: boxed(then),
                otherwise: boxed(otherwise),
            },
            DocMetric::Qualified { dataset, metric } => DocMetric::Qualified {
                dataset,
                metric: boxed(metric),
            },
            DocMetric::PerDataset(map) => DocMetric::PerDataset(
                map.into_iter()
                    .map(|(d, m)| (d, m.transform(g, i)))
                    .collect(),
            ),
            DocMetric::SampleMetric {
                metric,
                numerator,
                denominator,
                salt,
            } => DocMetric::SampleMetric {
                metric: boxed(metric),
                numerator,
                denominator,
                salt,
            },
            DocMetric::RandomMetric { metric, max, salt } => DocMetric::RandomMetric {
                metric: boxed(metric),
                max,
                salt,
            },
            leaf => leaf,
        };
        g(rebuilt)
    }

    /// Postfix program computing this metric in `dataset`
    pub fn get_pushes(&self, dataset: &str) -> CompileResult<Vec<String>> {
        let field_name = |field: &FieldSet| field.dataset_field_name(dataset).map(str::to_string);
        let single = |push: String| Ok(vec![push]);
        match self {
            DocMetric::Field(field) => single(field_name(field)?),
            DocMetric::Constant(v) => single(v.to_string()),
            DocMetric::Count => single("count()".to_string()),
            DocMetric::DocId => single("docId()".to_string()),
            DocMetric::Log {
                metric,
                scale_factor,
            } => unop(metric, dataset, format!("log {}", scale_factor)),
            DocMetric::Exponentiate {
                metric,
                scale_factor,
            } => unop(metric, dataset, format!("exp {}", scale_factor)),
            DocMetric::Negate(m) => {
                DocMetric::subtract(DocMetric::Constant(0), (**m).clone()).get_pushes(dataset)
            }
            DocMetric::Abs(m) => unop(m, dataset, "abs()".to_string()),
            DocMetric::Signum(m) => {
                let expanded = DocMetric::if_then_else(
                    DocFilter::compare(CompareOp::Gt, (**m).clone(), DocMetric::Constant(0)),
                    DocMetric::Constant(1),
                    DocMetric::if_then_else(
                        DocFilter::compare(CompareOp::Lt, (**m).clone(), DocMetric::Constant(0)),
                        DocMetric::Constant(-1),
                        DocMetric::Constant(0),
                    ),
                );
                expanded.get_pushes(dataset)
            }
            DocMetric::Add(ms) => chain(ms, dataset, "+"),
            DocMetric::Min(ms) => chain(ms, dataset, "min()"),
            DocMetric::Max(ms) => chain(ms, dataset, "max()"),
            DocMetric::Binary { op, left, right } => binop(left, right, dataset, op.symbol()),
            DocMetric::Compare { op, left, right } => binop(left, right, dataset, op.symbol()),
            DocMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                let truth = condition.as_zero_one_metric(dataset)?;
                let true_or_zero = DocMetric::multiply(truth.clone(), (**then).clone());
                let false_or_zero = DocMetric::multiply(
                    DocMetric::subtract(DocMetric::Constant(1), truth),
                    (**otherwise).clone(),
                );
                DocMetric::add(vec![true_or_zero, false_or_zero]).get_pushes(dataset)
            }
            DocMetric::Regex { field, pattern } => {
                single(format!("regex {}:{}", field_name(field)?, pattern))
            }
            DocMetric::Extract {
                field,
                pattern,
                group_number,
            } => single(format!(
                "regexmatch {} {} {}",
                field_name(field)?,
                group_number,
                pattern
            )),
            DocMetric::HasInt { field, term } => {
                single(format!("hasint {}:{}", field_name(field)?, term))
            }
            DocMetric::HasString { field, term } => {
                single(format!("hasstr {}:{}", field_name(field)?, term))
            }
            DocMetric::HasIntField(field) => single(format!("hasintfield {}", field_name(field)?)),
            DocMetric::HasStringField(field) => {
                single(format!("hasstrfield {}", field_name(field)?))
            }
            DocMetric::FieldEqual { left, right } => single(format!(
                "fieldequal {}={}",
                field_name(left)?,
                field_name(right)?
            )),
            DocMetric::FloatScale { field, mult, add } => {
                single(format!("floatscale {}*{}+{}", field_name(field)?, mult, add))
            }
            DocMetric::StringLen(field) => single(format!("len {}", field_name(field)?)),
            DocMetric::IntTermCount(field) => {
                single(format!("inttermcount {}", field_name(field)?))
            }
            DocMetric::StrTermCount(field) => {
                single(format!("strtermcount {}", field_name(field)?))
            }
            DocMetric::Lucene { per_dataset, .. } => {
                let query = per_dataset
                    .get(dataset)
                    .ok_or_else(|| CompileError::UnknownDataset(dataset.to_string()))?;
                let encoded = serde_json::to_vec(query)
                    .map_err(|e| CompileError::Internal(e.to_string()))?;
                single(format!(
                    "lucene {}",
                    base64::engine::general_purpose::STANDARD.encode(encoded)
                ))
            }
            DocMetric::Qualified {
                dataset: qualified,
                metric,
            } => {
                if qualified != dataset {
                    return Err(CompileError::Invalid(format!(
                        "Qualified DocMetric getting pushes for a different dataset! [{}] != [{}]",
                        qualified, dataset
                    )));
                }
                metric.get_pushes(dataset)
            }
            DocMetric::PerDataset(map) => map
                .get(dataset)
                .ok_or_else(|| CompileError::UnknownDataset(dataset.to_string()))?
                .get_pushes(dataset),
            DocMetric::Sample {
                field,
                is_int_field,
                numerator,
                denominator,
                salt,
            } => single(format!(
                "random {} [{}] {} \"{}\"",
                int_or_str(*is_int_field),
                *numerator as f64 / *denominator as f64,
                field_name(field)?,
                salt
            )),
            DocMetric::SampleMetric {
                metric,
                numerator,
                denominator,
                salt,
            } => unop(
                metric,
                dataset,
                format!(
                    "random_metric [{}] \"{}\"",
                    *numerator as f64 / *denominator as f64,
                    salt
                ),
            ),
            DocMetric::Random {
                field,
                is_int_field,
                max,
                salt,
            } => single(format!(
                "random {} [{}] {} \"{}\"",
                int_or_str(*is_int_field),
                percentages(*max),
                field_name(field)?,
                salt
            )),
            DocMetric::RandomMetric { metric, max, salt } => unop(
                metric,
                dataset,
                format!("random_metric [{}] \"{}\"", percentages(*max), salt),
            ),
        }
    }

    /// Check field existence and types against `dataset`
    pub fn validate(&self, dataset: &str, helper: &ValidationHelper, errors: &mut ErrorCollector) {
        let context = || format!("{:?}", self);
        match self {
            DocMetric::Field(field) => check_field(field, dataset, errors, &|name, errors| {
                helper.validate_int_field(dataset, name, &context(), errors)
            }),
            DocMetric::Constant(_) | DocMetric::Count | DocMetric::DocId => {}
            DocMetric::Log { metric, .. }
            | DocMetric::Exponentiate { metric, .. }
            | DocMetric::Negate(metric)
            | DocMetric::Abs(metric)
            | DocMetric::Signum(metric)
            | DocMetric::SampleMetric { metric, .. }
            | DocMetric::RandomMetric { metric, .. } => metric.validate(dataset, helper, errors),
            DocMetric::Add(ms) | DocMetric::Min(ms) | DocMetric::Max(ms) => {
                for m in ms {
                    m.validate(dataset, helper, errors);
                }
            }
            DocMetric::Binary { left, right, .. } | DocMetric::Compare { left, right, .. } => {
                left.validate(dataset, helper, errors);
                right.validate(dataset, helper, errors);
            }
            DocMetric::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                condition.validate(dataset, helper, errors);
                then.validate(dataset, helper, errors);
                otherwise.validate(dataset, helper, errors);
            }
            DocMetric::Regex { field, pattern } | DocMetric::Extract { field, pattern, .. } => {
                check_field(field, dataset, errors, &|name, errors| {
                    helper.validate_field(dataset, name, &context(), errors)
                });
                validate_regex(pattern, errors);
            }
            DocMetric::HasInt { field, .. } | DocMetric::HasIntField(field) => {
                check_field(field, dataset, errors, &|name, errors| {
                    helper.validate_field(dataset, name, &context(), errors)
                })
            }
            DocMetric::HasString { field, .. }
            | DocMetric::HasStringField(field)
            | DocMetric::StringLen(field) => check_field(field, dataset, errors, &|name, errors| {
                helper.validate_field(dataset, name, &context(), errors)
            }),
            DocMetric::FieldEqual { left, right } => {
                for field in [left, right] {
                    check_field(field, dataset, errors, &|name, errors| {
                        helper.validate_field(dataset, name, &context(), errors)
                    });
                }
            }
            DocMetric::FloatScale { field, .. } => check_field(field, dataset, errors, &|name, errors| {
                helper.validate_string_field(dataset, name, &context(), errors)
            }),
            DocMetric::IntTermCount(field) => check_field(field, dataset, errors, &|name, errors| {
                if helper.contains_int_field(dataset, name) {
                    return;
                }
                if helper.contains_string_field(dataset, name) {
                    errors.warn(format!(
                        "Suspicious use of INTTERMCOUNT. Did you mean STRTERMCOUNT? \
                         Using operator INTTERMCOUNT over string field \"{}\" in dataset \"{}\". \
                         Only string terms that can be converted to integer value will be counted. \
                         If you want to get all terms count in a string field use STRTERMCOUNT operator instead",
                        field, dataset
                    ));
                } else {
                    errors.error(missing_field(dataset, name, &context()));
                }
            }),
            DocMetric::StrTermCount(field) => check_field(field, dataset, errors, &|name, errors| {
                if helper.contains_string_field(dataset, name) {
                    return;
                }
                if helper.contains_int_field(dataset, name) {
                    errors.warn(format!(
                        "Using operator STRTERMCOUNT over int field \"{}\" in dataset \"{}\". \
                         Result is always zero.",
                        field, dataset
                    ));
                } else {
                    errors.error(missing_field(dataset, name, &context()));
                }
            }),
            DocMetric::Lucene { per_dataset, .. } => match per_dataset.get(dataset) {
                Some(query) => query.validate(dataset, helper, errors),
                None => errors.error(format!("Unknown dataset: {}", dataset)),
            },
            DocMetric::Qualified {
                dataset: qualified,
                metric,
            } => {
                if qualified != dataset {
                    errors.error(format!(
                        "Qualified DocMetric getting validated against different dataset! [{}] != [{}]",
                        qualified, dataset
                    ));
                }
                metric.validate(dataset, helper, errors);
            }
            DocMetric::PerDataset(map) => match map.get(dataset) {
                Some(metric) => metric.validate(dataset, helper, errors),
                None => errors.error(format!("Unknown dataset: {}", dataset)),
            },
            DocMetric::Sample {
                field,
                is_int_field,
                ..
            }
            | DocMetric::Random {
                field,
                is_int_field,
                ..
            } => check_field(field, dataset, errors, &|name, errors| {
                if *is_int_field {
                    helper.validate_int_field(dataset, name, &context(), errors)
                } else {
                    helper.validate_string_field(dataset, name, &context(), errors)
                }
            }),
        }
    }
}

fn check_field(
    field: &FieldSet,
    dataset: &str,
    errors: &mut ErrorCollector,
    check: &dyn Fn(&str, &mut ErrorCollector),
) {
    match field.dataset_field_name(dataset) {
        Ok(name) => check(name, errors),
        Err(e) => errors.error(e.to_string()),
    }
}

fn flatten<T>(items: Vec<T>, unwrap: impl Fn(T) -> Result<Vec<T>, T>) -> Vec<T> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match unwrap(item) {
            Ok(inner) => out.extend(inner),
            Err(item) => out.push(item),
        }
    }
    out
}

fn extremum(metrics: Vec<DocMetric>, is_min: bool) -> DocMetric {
    let mut terms = Vec::with_capacity(metrics.len());
    let mut constant: Option<i64> = None;
    let pick = |a: i64, b: i64| if is_min { a.min(b) } else { a.max(b) };
    for metric in flatten(metrics, |m| match m {
        DocMetric::Min(inner) if is_min => Ok(inner),
        DocMetric::Max(inner) if !is_min => Ok(inner),
        other => Err(other),
    }) {
        let value = match metric {
            DocMetric::Constant(v) => v,
            DocMetric::Count => 1,
            other => {
                terms.push(other);
                continue;
            }
        };
        constant = Some(constant.map_or(value, |c| pick(c, value)));
    }
    if let Some(c) = constant {
        terms.push(DocMetric::Constant(c));
    }
    match terms.len() {
        0 => DocMetric::Constant(0),
        1 => terms.remove(0),
        _ if is_min => DocMetric::Min(terms),
        _ => DocMetric::Max(terms),
    }
}

fn transform_all(
    metrics: Vec<DocMetric>,
    g: &dyn Fn(DocMetric) -> DocMetric,
    i: &dyn Fn(DocFilter) -> DocFilter,
) -> Vec<DocMetric> {
    metrics.into_iter().map(|m| m.transform(g, i)).collect()
}

fn unop(metric: &DocMetric, dataset: &str, operator: String) -> CompileResult<Vec<String>> {
    let mut pushes = metric.get_pushes(dataset)?;
    pushes.push(operator);
    Ok(pushes)
}

fn binop(left: &DocMetric, right: &DocMetric, dataset: &str, operator: &str) -> CompileResult<Vec<String>> {
    let mut pushes = left.get_pushes(dataset)?;
    pushes.extend(right.get_pushes(dataset)?);
    pushes.push(operator.to_string());
    Ok(pushes)
}

/// `m0 m1 op m2 op ...`
fn chain(metrics: &[DocMetric], dataset: &str, operator: &str) -> CompileResult<Vec<String>> {
    let mut pushes = Vec::new();
    for (idx, metric) in metrics.iter().enumerate() {
        pushes.extend(metric.get_pushes(dataset)?);
        if idx > 0 {
            pushes.push(operator.to_string());
        }
    }
    Ok(pushes)
}

fn int_or_str(is_int: bool) -> &'static str {
    if is_int {
        "int"
    } else {
        "str"
    }
}

/// Bucket boundaries `1/max, 2/max, ..., (max-1)/max`
fn percentages(max: u32) -> String {
    (1..max)
        .map(|i| (i as f64 / max as f64).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatasetMetadata;

    fn field(name: &str) -> DocMetric {
        DocMetric::Field(FieldSet::single("ds", name))
    }

    fn helper() -> ValidationHelper {
        let mut map = BTreeMap::new();
        map.insert(
            "ds".to_string(),
            DatasetMetadata::new("ds")
                .with_int_fields(&["clicks", "impressions"])
                .with_string_fields(&["country"]),
        );
        ValidationHelper::new(map)
    }

    #[test]
    fn test_add_folds_constants() {
        assert_eq!(
            DocMetric::add(vec![DocMetric::Constant(2), DocMetric::Constant(3)]),
            DocMetric::Constant(5)
        );
        assert_eq!(DocMetric::add(vec![]), DocMetric::Constant(0));
        assert_eq!(
            DocMetric::add(vec![field("clicks"), DocMetric::Count, DocMetric::Constant(-1)]),
            field("clicks")
        );
    }

    #[test]
    fn test_add_flattens() {
        let nested = DocMetric::add(vec![
            DocMetric::add(vec![field("clicks"), field("impressions")]),
            field("x"),
        ]);
        let flat = DocMetric::add(vec![field("clicks"), field("impressions"), field("x")]);
        assert_eq!(nested, flat);
        assert!(matches!(flat, DocMetric::Add(ref ms) if ms.len() == 3));
    }

    #[test]
    fn test_min_max_fold() {
        let m = DocMetric::min(vec![
            DocMetric::Constant(4),
            DocMetric::min(vec![field("clicks"), DocMetric::Constant(2)]),
        ]);
        assert_eq!(
            m,
            DocMetric::Min(vec![field("clicks"), DocMetric::Constant(2)])
        );
        assert_eq!(
            DocMetric::max(vec![DocMetric::Constant(4), DocMetric::Constant(9)]),
            DocMetric::Constant(9)
        );
    }

    #[test]
    fn test_pushes() {
        let m = DocMetric::add(vec![
            field("clicks"),
            DocMetric::multiply(DocMetric::Constant(2), field("impressions")),
        ]);
        assert_eq!(
            m.get_pushes("ds").unwrap(),
            vec!["clicks", "2", "impressions", "*", "+"]
        );
        assert_eq!(
            DocMetric::Negate(Box::new(field("clicks"))).get_pushes("ds").unwrap(),
            vec!["0", "clicks", "-"]
        );
    }

    #[test]
    fn test_pushes_unknown_dataset() {
        assert_eq!(
            field("clicks").get_pushes("other").unwrap_err(),
            CompileError::UnknownDataset("other".to_string())
        );
    }

    #[test]
    fn test_qualified_pushes_other_dataset_fails() {
        let m = DocMetric::Qualified {
            dataset: "ds".to_string(),
            metric: Box::new(DocMetric::Count),
        };
        assert_eq!(m.get_pushes("ds").unwrap(), vec!["count()"]);
        assert!(m.get_pushes("other").is_err());
    }

    #[test]
    fn test_random_pushes() {
        let m = DocMetric::Random {
            field: FieldSet::single("ds", "country"),
            is_int_field: false,
            max: 4,
            salt: "s".to_string(),
        };
        assert_eq!(
            m.get_pushes("ds").unwrap(),
            vec!["random str [0.25,0.5,0.75] country \"s\""]
        );
    }

    #[test]
    fn test_if_then_else_pushes() {
        let m = DocMetric::if_then_else(DocFilter::Always, field("clicks"), DocMetric::Constant(0));
        assert_eq!(
            m.get_pushes("ds").unwrap(),
            vec!["1", "clicks", "*", "1", "1", "-", "0", "*", "+"]
        );
    }

    #[test]
    fn test_transform_is_post_order() {
        let m = DocMetric::Abs(Box::new(DocMetric::Constant(-3)));
        let folded = m.transform(
            &|m| match m {
                DocMetric::Abs(inner) => match *inner {
                    DocMetric::Constant(v) => DocMetric::Constant(v.abs()),
                    other => DocMetric::Abs(Box::new(other)),
                },
                DocMetric::Constant(v) => DocMetric::Constant(v * 10),
                other => other,
            },
            &|f| f,
        );
        assert_eq!(folded, DocMetric::Constant(30));
    }

    #[test]
    fn test_compare_to_filter_and_invert() {
        let m = DocMetric::compare(CompareOp::Gt, field("clicks"), DocMetric::Constant(5));
        assert!(m.is_zero_one());
        assert_eq!(
            m.invert().unwrap(),
            DocMetric::compare(CompareOp::Lte, field("clicks"), DocMetric::Constant(5))
        );
        assert_eq!(
            m.to_filter().unwrap(),
            DocFilter::compare(CompareOp::Gt, field("clicks"), DocMetric::Constant(5))
        );
        assert!(field("clicks").to_filter().is_none());
    }

    #[test]
    fn test_validate_term_count_warnings() {
        let helper = helper();
        let mut errors = ErrorCollector::new();
        DocMetric::IntTermCount(FieldSet::single("ds", "country")).validate("ds", &helper, &mut errors);
        DocMetric::StrTermCount(FieldSet::single("ds", "clicks")).validate("ds", &helper, &mut errors);
        assert!(!errors.has_errors());
        assert_eq!(errors.warnings().len(), 2);
        assert!(errors.warnings()[0].starts_with("Suspicious use of INTTERMCOUNT"));
        assert!(errors.warnings()[1].ends_with("Result is always zero."));

        DocMetric::IntTermCount(FieldSet::single("ds", "missing")).validate("ds", &helper, &mut errors);
        assert!(errors.has_errors());
    }

    #[test]
    fn test_validate_missing_field_and_regex() {
        let helper = helper();
        let mut errors = ErrorCollector::new();
        field("nope").validate("ds", &helper, &mut errors);
        DocMetric::Regex {
            field: FieldSet::single("ds", "country"),
            pattern: "(".to_string(),
        }
        .validate("ds", &helper, &mut errors);
        assert_eq!(errors.errors().len(), 2);
    }
}
