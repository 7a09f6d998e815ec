//! Compile error types
//!
//! Errors raised while resolving, validating, transforming and lowering a query.

use thiserror::Error;

/// Errors that can occur while compiling a query
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// Query text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Dataset is not part of the query or the catalog
    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    /// Field does not exist in a dataset
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// Query is well-formed but semantically invalid
    #[error("Invalid query: {0}")]
    Invalid(String),

    /// One or more validation errors were collected
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Construct has no lowering for the requested target
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Metadata could not be loaded
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Pipeline invariant was violated
    #[error("Internal error: {0}")]
    Internal(String),

    /// Lowered metric could not be evaluated
    #[error("Execution error: {0}")]
    Execution(String),
}

impl From<crate::execution::ExecutionError> for CompileError {
    fn from(err: crate::execution::ExecutionError) -> Self {
        CompileError::Execution(err.to_string())
    }
}

impl From<crate::catalog::CatalogError> for CompileError {
    fn from(err: crate::catalog::CatalogError) -> Self {
        CompileError::Catalog(err.to_string())
    }
}

/// Result type for compile operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Report a broken invariant between pipeline passes
pub(crate) fn internal<T>(message: impl Into<String>) -> CompileResult<T> {
    Err(CompileError::Internal(message.into()))
}
