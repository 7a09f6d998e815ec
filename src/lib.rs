//! # JQL
//!
//! Front end and logical-plan compiler for an analytical query language over
//! an inverted-index grouping engine. A query is parsed, resolved against
//! dataset metadata, rewritten, and lowered into the command sequence the
//! engine runs.
//!
//! ## Features
//!
//! - **Multi-dataset queries**: per-dataset field resolution, aliases and dimensions
//! - **Filters as regroups**: document filters lowered to query, metric and regex actions
//! - **Precomputation**: nested aggregates scheduled as group stats lookups
//! - **Validation**: every error and warning of a query reported at once
//! - **Stable cache keys**: identical compilations share a result file name
//!
//! ## Modules
//!
//! - [`query`]: textual front end and the compiler driver
//! - [`language`]: the query algebra, rewrite passes and engine commands
//! - [`fields`]: field and dataset resolution
//! - [`catalog`]: dataset metadata and where it comes from
//! - [`execution`]: execution-time metric algebra, result rendering, cache keys
//! - [`api`]: REST API server with Axum
//!
//! ## Quick Start
//!
//! ```rust
//! use jql::catalog::{DatasetCatalog, DatasetMetadata};
//! use jql::config::CompileConfig;
//! use jql::query::Compiler;
//!
//! let catalog = DatasetCatalog::new(vec![DatasetMetadata::new("jobsearch")
//!     .with_int_fields(&["clicks", "unixtime"])
//!     .with_string_fields(&["country"])]);
//!
//! let compiler = Compiler::new(catalog, CompileConfig::default());
//! let compiled = compiler
//!     .compile("FROM jobsearch 2024-01-01 2024-01-02 WHERE country = us GROUP BY country SELECT clicks")
//!     .unwrap();
//!
//! assert!(compiled.warnings.is_empty());
//! println!("{}", compiled.commands_json().unwrap());
//! ```

pub mod api;
pub mod catalog;
pub mod config;
pub mod execution;
pub mod fields;
pub mod language;
pub mod query;
pub mod term;

// Re-export top-level types for convenience
pub use catalog::{CatalogError, DatasetCatalog, DatasetMetadata, FieldType, MetadataSource};

pub use query::{parse_query, CompiledQuery, Compiler, QueryError, QueryResult};

pub use language::{Command, CompileError, CompileResult, Query};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{CompileConfig, Config, ConfigError, LoggingConfig};

pub use term::Term;
