//! API Error Types
//!
//! Defines error types for the API layer and implements conversion
//! to HTTP responses with appropriate status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::language::CompileError;
use crate::query::QueryError;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Query did not parse or compile
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Dataset metadata could not be loaded
    #[error("Catalog unavailable: {0}")]
    Catalog(#[from] CatalogError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub request_id: String,
}

/// Error details
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Every collected compile error, when there were several
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Query(QueryError::Parse { .. }) => (StatusCode::BAD_REQUEST, "PARSE_ERROR"),
            ApiError::Query(QueryError::Compile(CompileError::Internal(_))) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            ApiError::Query(QueryError::Compile(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "COMPILE_ERROR")
            }
            ApiError::Catalog(_) => (StatusCode::SERVICE_UNAVAILABLE, "CATALOG_UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "API error occurred"
            );
        } else {
            tracing::debug!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "Request rejected"
            );
        }

        let (details, line, column) = match &self {
            ApiError::Query(QueryError::Compile(CompileError::Validation(errors))) => {
                (errors.clone(), None, None)
            }
            ApiError::Query(QueryError::Parse { line, column, .. }) => {
                (Vec::new(), Some(*line), Some(*column))
            }
            _ => (Vec::new(), None, None),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
                details,
                line,
                column,
            },
            request_id,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let parse = ApiError::Query(QueryError::at("FROM", 4, "Unexpected end of query"));
        assert_eq!(parse.status_and_code(), (StatusCode::BAD_REQUEST, "PARSE_ERROR"));

        let compile = ApiError::Query(CompileError::Validation(vec!["x".into()]).into());
        assert_eq!(compile.status_and_code().0, StatusCode::UNPROCESSABLE_ENTITY);

        let internal = ApiError::Query(CompileError::Internal("x".into()).into());
        assert_eq!(internal.status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);

        let catalog = ApiError::Catalog(CatalogError::Fetch("down".into()));
        assert_eq!(catalog.status_and_code().0, StatusCode::SERVICE_UNAVAILABLE);
    }
}
