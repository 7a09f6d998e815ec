//! JQL front end
//!
//! Turns query text into the command list the engine runs:
//!
//! - **ast**: what the parser produces, names as typed
//! - **parser**: nom grammar for queries, doc metrics and doc filters
//! - **compiler**: name resolution, rewrite passes and lowering
//!
//! # Query Language
//!
//! ```text
//! FROM dataset start end [AS alias] [, ...]
//! [WHERE doc_filter]
//! [GROUP BY group [HAVING filter] [, ...]]
//! [SELECT metric [AS name] [, ...]]
//! [LIMIT n]
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use jql::catalog::DatasetCatalog;
//! use jql::config::CompileConfig;
//! use jql::query::Compiler;
//!
//! let catalog = DatasetCatalog::load("datasets.toml")?;
//! let compiler = Compiler::new(catalog, CompileConfig::default());
//! let compiled = compiler.compile("FROM jobsearch 1d today GROUP BY country SELECT count()")?;
//! println!("{}", compiled.commands_json()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod ast;
pub mod compiler;
pub mod error;
pub mod parser;

pub use ast::QueryAst;
pub use compiler::{execution_steps, resolve_time, CompiledQuery, Compiler, Planned};
pub use error::{QueryError, QueryResult};
pub use parser::{parse_doc_filter, parse_doc_metric, parse_query};
