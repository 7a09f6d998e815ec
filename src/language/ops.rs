//! Operators shared by the doc-level and group-level algebras

use serde::{Deserialize, Serialize};
use std::fmt;

/// Binary comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    /// Push operator understood by the grouping engine
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
        }
    }

    /// Logical inverse: `!(a op b) == (a op.negate() b)`
    pub fn negate(&self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::Lt => CompareOp::Gte,
            CompareOp::Lte => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Lte,
            CompareOp::Gte => CompareOp::Lt,
        }
    }

    pub fn apply_i64(&self, left: i64, right: i64) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Lte => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Gte => left >= right,
        }
    }

    pub fn apply_f64(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Lte => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Gte => left >= right,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Non-associative integer arithmetic on doc metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithOp {
    Subtract,
    Multiply,
    Divide,
    Modulus,
}

impl ArithOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Subtract => "-",
            ArithOp::Multiply => "*",
            ArithOp::Divide => "/",
            ArithOp::Modulus => "%",
        }
    }

    /// Constant-fold; `None` on overflow or division by zero
    pub fn apply(&self, left: i64, right: i64) -> Option<i64> {
        match self {
            ArithOp::Subtract => left.checked_sub(right),
            ArithOp::Multiply => left.checked_mul(right),
            ArithOp::Divide => left.checked_div(right),
            ArithOp::Modulus => left.checked_rem(right),
        }
    }
}

/// Floating point arithmetic on group-level metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Power,
}

impl MathOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            MathOp::Add => "+",
            MathOp::Subtract => "-",
            MathOp::Multiply => "*",
            MathOp::Divide => "/",
            MathOp::Modulus => "%",
            MathOp::Power => "^",
        }
    }

    pub fn apply(&self, left: f64, right: f64) -> f64 {
        match self {
            MathOp::Add => left + right,
            MathOp::Subtract => left - right,
            MathOp::Multiply => left * right,
            MathOp::Divide => left / right,
            MathOp::Modulus => left % right,
            MathOp::Power => left.powf(right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negate_is_inverse() {
        for op in [
            CompareOp::Eq,
            CompareOp::Ne,
            CompareOp::Lt,
            CompareOp::Lte,
            CompareOp::Gt,
            CompareOp::Gte,
        ] {
            assert_eq!(op.negate().negate(), op);
            for (a, b) in [(1, 2), (2, 2), (3, 2)] {
                assert_eq!(op.apply_i64(a, b), !op.negate().apply_i64(a, b));
            }
        }
    }

    #[test]
    fn test_arith_fold() {
        assert_eq!(ArithOp::Divide.apply(7, 2), Some(3));
        assert_eq!(ArithOp::Divide.apply(7, 0), None);
        assert_eq!(ArithOp::Modulus.apply(7, 0), None);
        assert_eq!(ArithOp::Multiply.apply(i64::MAX, 2), None);
    }

    #[test]
    fn test_math_op() {
        assert_eq!(MathOp::Power.apply(2.0, 10.0), 1024.0);
        assert!(MathOp::Divide.apply(1.0, 0.0).is_infinite());
        assert_eq!(MathOp::Modulus.apply(7.0, 4.0), 3.0);
    }
}
