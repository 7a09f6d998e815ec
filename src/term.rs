//! Term values
//!
//! A term is a single value of a field: either an integer or a string.
//! Literals such as `"007"` or `"+5"` parse as integers but keep their
//! original text, so rendering them back never loses leading zeros or signs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single field value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Term {
    /// Integer term; `original` is set when the literal text differs from the canonical form
    Int {
        value: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original: Option<String>,
    },
    /// String term
    #[serde(rename = "string")]
    Str { value: String },
}

impl Term {
    /// Parse a literal, preferring the integer interpretation when it is representable
    pub fn term(text: &str) -> Self {
        match text.parse::<i64>() {
            Ok(value) => {
                let original = if value.to_string() == text {
                    None
                } else {
                    Some(text.to_string())
                };
                Term::Int { value, original }
            }
            Err(_) => Term::Str {
                value: text.to_string(),
            },
        }
    }

    /// Integer term with canonical text
    pub fn int(value: i64) -> Self {
        Term::Int {
            value,
            original: None,
        }
    }

    /// String term, never reinterpreted as an integer
    pub fn string(value: impl Into<String>) -> Self {
        Term::Str {
            value: value.into(),
        }
    }

    pub fn is_int_term(&self) -> bool {
        matches!(self, Term::Int { .. })
    }

    /// Integer value, if this term is (or parses as) an integer
    pub fn int_value(&self) -> Option<i64> {
        match self {
            Term::Int { value, .. } => Some(*value),
            Term::Str { value } => value.parse().ok(),
        }
    }

    /// Canonical string form; integers keep their original literal text
    pub fn as_string(&self) -> String {
        match self {
            Term::Int {
                original: Some(text),
                ..
            } => text.clone(),
            Term::Int { value, .. } => value.to_string(),
            Term::Str { value } => value.clone(),
        }
    }

    /// Whether this term can be used against an integer field
    pub fn is_representable_as_int(&self) -> bool {
        self.int_value().is_some()
    }

    /// Drop the integer interpretation, keeping the literal text
    pub fn to_string_term(&self) -> Term {
        match self {
            Term::Str { .. } => self.clone(),
            Term::Int { .. } => Term::string(self.as_string()),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Int { .. } => write!(f, "{}", self.as_string()),
            Term::Str { value } => write!(f, "\"{}\"", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_zeros_preserved() {
        let term = Term::term("007");
        assert!(term.is_int_term());
        assert_eq!(term.int_value(), Some(7));
        assert_eq!(term.as_string(), "007");
    }

    #[test]
    fn test_canonical_int_has_no_original() {
        assert_eq!(Term::term("42"), Term::int(42));
        assert_eq!(Term::term("+42").as_string(), "+42");
        assert_ne!(Term::term("+42"), Term::int(42));
    }

    #[test]
    fn test_string_term() {
        let term = Term::term("abc");
        assert!(!term.is_int_term());
        assert_eq!(term.int_value(), None);
        assert_eq!(term.to_string(), "\"abc\"");
    }

    #[test]
    fn test_string_constructor_keeps_digits_as_string() {
        let term = Term::string("12");
        assert!(!term.is_int_term());
        assert!(term.is_representable_as_int());
        assert_eq!(Term::term("012").to_string_term(), Term::string("012"));
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_value(Term::int(3)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "int", "value": 3}));
        let json = serde_json::to_value(Term::string("a")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "string", "value": "a"}));
    }
}
