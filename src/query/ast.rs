//! Query Abstract Syntax Tree
//!
//! What the parser produces: names exactly as typed, nothing resolved. The
//! [`compiler`](super::compiler) resolves names against the catalog and
//! builds the typed [`language`](crate::language) algebra.
//!
//! # Example Queries
//!
//! ```text
//! FROM jobsearch 2024-01-01 2024-01-02
//! WHERE country = "us" AND NOT q =~ "engineer.*"
//! GROUP BY country[10 BY clicks], time(1d)
//! SELECT count(), clicks / count() AS ctr
//! ```

use crate::language::CompareOp;
use crate::term::Term;

/// A field or dataset name, optionally prefixed with a dataset: `ds.field`
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedName {
    pub scope: Option<String>,
    pub name: String,
}

impl ScopedName {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            scope: None,
            name: name.into(),
        }
    }

    pub fn scoped(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ScopedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}.{}", scope, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Point in time as written in `FROM`
#[derive(Debug, Clone, PartialEq)]
pub enum TimeAst {
    /// `2024-01-01`, `2024-01-01T12:00:00` or a quoted RFC 3339 timestamp
    Absolute(String),
    /// `7d` (ago), `12h`, `30m`, `2w`
    Ago { amount: i64, unit: char },
    Now,
    Today,
    Yesterday,
}

/// A parsed query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAst {
    pub datasets: Vec<DatasetAst>,
    pub filter: Option<DocFilterAst>,
    pub group_bys: Vec<GroupByEntryAst>,
    pub selects: Vec<SelectAst>,
    pub limit: Option<u64>,
}

/// `name [start end] [AS alias] [ALIASING (actual AS virtual, ...)]`
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetAst {
    pub name: String,
    pub start: Option<TimeAst>,
    pub end: Option<TimeAst>,
    pub alias: Option<String>,
    /// (actual, virtual)
    pub field_aliases: Vec<(String, String)>,
}

impl DatasetAst {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: None,
            end: None,
            alias: None,
            field_aliases: Vec::new(),
        }
    }
}

/// Integer arithmetic operators of the doc-level language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithAst {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocMetricAst {
    /// Field or dimension
    Name(ScopedName),
    Int(i64),
    Count,
    DocId,
    Negate(Box<DocMetricAst>),
    Binary {
        op: ArithAst,
        left: Box<DocMetricAst>,
        right: Box<DocMetricAst>,
    },
    Abs(Box<DocMetricAst>),
    Signum(Box<DocMetricAst>),
    Log {
        metric: Box<DocMetricAst>,
        scale_factor: i32,
    },
    Exp {
        metric: Box<DocMetricAst>,
        scale_factor: i32,
    },
    Min(Vec<DocMetricAst>),
    Max(Vec<DocMetricAst>),
    HasInt {
        field: ScopedName,
        term: i64,
    },
    HasStr {
        field: ScopedName,
        term: String,
    },
    HasIntField(ScopedName),
    HasStrField(ScopedName),
    Len(ScopedName),
    IntTermCount(ScopedName),
    StrTermCount(ScopedName),
    FloatScale {
        field: ScopedName,
        mult: f64,
        add: f64,
    },
    Extract {
        field: ScopedName,
        pattern: String,
        group_number: u32,
    },
    IfThenElse {
        condition: Box<DocFilterAst>,
        then: Box<DocMetricAst>,
        otherwise: Box<DocMetricAst>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocFilterAst {
    /// `f = term` / `f != term`
    FieldIs {
        field: ScopedName,
        term: Term,
        negated: bool,
    },
    /// `f =~ "re"` / `f !=~ "re"`
    Regex {
        field: ScopedName,
        pattern: String,
        negated: bool,
    },
    /// `f IN (..)` / `f NOT IN (..)`
    FieldIn {
        field: ScopedName,
        terms: Vec<Term>,
        negated: bool,
    },
    /// `between(f, lo, hi)`: `lo <= f < hi`
    Between {
        field: ScopedName,
        lower: i64,
        upper: i64,
    },
    Compare {
        op: CompareOp,
        left: DocMetricAst,
        right: DocMetricAst,
    },
    Lucene(String),
    /// `sample(f, n[, d[, "seed"]])`
    Sample {
        field: ScopedName,
        numerator: u64,
        denominator: Option<u64>,
        seed: Option<String>,
    },
    Bool(bool),
    And(Vec<DocFilterAst>),
    Or(Vec<DocFilterAst>),
    Not(Box<DocFilterAst>),
    /// `ds.(filter)`
    Qualified {
        datasets: Vec<String>,
        filter: Box<DocFilterAst>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggMetricAst {
    Number(f64),
    /// Field, dimension or `AS` name
    Name(ScopedName),
    /// A doc metric summed per group: `count()`, `[clicks * 2]`, `hasstr(q, "x")`
    DocSum(DocMetricAst),
    Negate(Box<AggMetricAst>),
    Binary {
        op: crate::language::MathOp,
        left: Box<AggMetricAst>,
        right: Box<AggMetricAst>,
    },
    Abs(Box<AggMetricAst>),
    Log(Box<AggMetricAst>),
    Floor(Box<AggMetricAst>),
    Ceil(Box<AggMetricAst>),
    Round(Box<AggMetricAst>),
    Min(Vec<AggMetricAst>),
    Max(Vec<AggMetricAst>),
    /// `avg(m)`: per-document average
    Avg(Box<AggMetricAst>),
    Distinct {
        field: ScopedName,
        having: Option<Box<AggFilterAst>>,
        window: Option<usize>,
    },
    Percentile {
        field: ScopedName,
        percentile: f64,
    },
    FieldMin {
        field: ScopedName,
        metric: Option<Box<AggMetricAst>>,
    },
    FieldMax {
        field: ScopedName,
        metric: Option<Box<AggMetricAst>>,
    },
    Parent(Box<AggMetricAst>),
    Lag {
        lag: usize,
        metric: Box<AggMetricAst>,
    },
    Running(Box<AggMetricAst>),
    Window {
        window: usize,
        metric: Box<AggMetricAst>,
    },
    SumAcross {
        group_by: Box<GroupByAst>,
        metric: Box<AggMetricAst>,
    },
    IfThenElse {
        condition: Box<AggFilterAst>,
        then: Box<AggMetricAst>,
        otherwise: Box<AggMetricAst>,
    },
    /// `ds.(metric)`
    Qualified {
        datasets: Vec<String>,
        metric: Box<AggMetricAst>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggFilterAst {
    Compare {
        op: CompareOp,
        left: AggMetricAst,
        right: AggMetricAst,
    },
    /// `term() = x`
    TermIs(Term),
    /// `term() =~ "re"`
    TermRegex(String),
    Bool(bool),
    And(Vec<AggFilterAst>),
    Or(Vec<AggFilterAst>),
    Not(Box<AggFilterAst>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupByAst {
    /// `f`, `f[k]`, `f[k BY m]`, optionally `WITH DEFAULT`
    Field {
        field: ScopedName,
        limit: Option<u64>,
        metric: Option<AggMetricAst>,
        with_default: bool,
    },
    /// `f IN (..)`
    FieldIn {
        field: ScopedName,
        terms: Vec<Term>,
        with_default: bool,
    },
    /// `bucket(m, lo, hi, interval[, gutters])`
    Bucket {
        metric: DocMetricAst,
        min: i64,
        max: i64,
        interval: i64,
        exclude_gutters: bool,
        with_default: bool,
    },
    /// `time(1d)`, `time(10b)` for buckets, optionally a field and format
    Time {
        period: String,
        field: Option<ScopedName>,
        format: Option<String>,
    },
    DayOfWeek,
    Month,
    Dataset,
    Quantiles {
        field: ScopedName,
        num_buckets: u32,
    },
    Predicate(DocFilterAst),
    Random {
        field: ScopedName,
        k: u32,
        salt: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupByEntryAst {
    pub group_by: GroupByAst,
    pub having: Option<AggFilterAst>,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectAst {
    pub metric: AggMetricAst,
    pub alias: Option<String>,
    /// `printf(m, "%.2f")`
    pub format: Option<String>,
}

impl SelectAst {
    pub fn new(metric: AggMetricAst) -> Self {
        Self {
            metric,
            alias: None,
            format: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_name_display() {
        assert_eq!(ScopedName::plain("country").to_string(), "country");
        assert_eq!(ScopedName::scoped("js", "country").to_string(), "js.country");
    }
}
