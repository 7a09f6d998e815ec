//! Query algebra and logical plan
//!
//! - **doc_metric / doc_filter**: per-document expressions, lowered to RPN
//!   pushes and regroup actions
//! - **aggregate_metric / aggregate_filter**: per-group expressions over
//!   the pushed stats
//! - **group_by**: grouping stages
//! - **plan**: the query all passes rewrite
//! - **passes**: tree rewrites between parsing and lowering
//! - **execution_step / commands / actions**: the plan and the engine IR
//! - **validation**: error and warning collection against dataset metadata
//!
//! # Architecture
//!
//! ```text
//!   Query ──passes──▶ Query' ──steps──▶ [ExecutionStep] ──commands()──▶ [Command]
//!                                                                         │
//!                                                                   validate()
//! ```

pub mod actions;
pub mod aggregate_filter;
pub mod aggregate_metric;
pub mod commands;
pub mod doc_filter;
pub mod doc_metric;
pub mod error;
pub mod execution_step;
pub mod group_by;
pub mod group_supplier;
pub mod lucene;
pub mod ops;
pub mod passes;
pub mod plan;
pub mod precomputed;
pub mod validation;

pub use actions::{optimize_consecutive_query_actions, Action, BooleanOp, DocQuery, QueryTerm};
pub use aggregate_filter::AggregateFilter;
pub use aggregate_metric::{AggregateMetric, Rewrite, Traversal};
pub use commands::{Command, FieldIterateOpts, GroupLookupMergeType, NamedComputation, TopK};
pub use doc_filter::DocFilter;
pub use doc_metric::DocMetric;
pub use error::{CompileError, CompileResult};
pub use execution_step::{ExecutionStep, DEFAULT_GROUP_NAME};
pub use group_by::GroupBy;
pub use group_supplier::GroupSupplier;
pub use lucene::{parse_lucene, LuceneQuery};
pub use ops::{ArithOp, CompareOp, MathOp};
pub use plan::{Dataset, GroupByEntry, Query};
pub use precomputed::{Precomputation, Precomputed};
pub use validation::{ErrorCollector, ValidationHelper};

pub(crate) use error::internal;
