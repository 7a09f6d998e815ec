//! Query error types
//!
//! Errors raised while parsing query text and driving the compiler.

use thiserror::Error;

use crate::language::CompileError;

/// Errors that can occur turning query text into commands
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Query text could not be parsed
    #[error("Parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    /// Query parsed but did not compile
    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl QueryError {
    /// Parse error located at byte `offset` of `source`
    pub fn at(source: &str, offset: usize, message: impl Into<String>) -> Self {
        let (line, column) = line_column(source, offset);
        QueryError::Parse {
            line,
            column,
            message: message.into(),
        }
    }
}

/// 1-based line and column of a byte offset
pub fn line_column(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(newline) => before[newline + 1..].chars().count() + 1,
        None => before.chars().count() + 1,
    };
    (line, column)
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_column() {
        let text = "FROM a\nWHERE x =";
        assert_eq!(line_column(text, 0), (1, 1));
        assert_eq!(line_column(text, 5), (1, 6));
        assert_eq!(line_column(text, 7), (2, 1));
        assert_eq!(line_column(text, 100), (2, 10));
    }

    #[test]
    fn test_display() {
        let err = QueryError::at("abc", 1, "Unexpected input");
        assert_eq!(err.to_string(), "Parse error at line 1, column 2: Unexpected input");
    }
}
