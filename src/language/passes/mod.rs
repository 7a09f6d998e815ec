//! Rewrites over a [`Query`](super::plan::Query)
//!
//! ```text
//! substitute_named ─▶ simplify ─▶ fix_top_k_having ─▶ extract_precomputed
//!                                                            │ query_steps
//!                                                            ▼
//!                                       optimize_last ─▶ ExecutionStep list
//! ```
//!
//! Every pass consumes its input tree and returns a new one.

pub mod extract_precomputed;
pub mod extract_qualified;
pub mod fix_top_k_having;
pub mod optimize_last;
pub mod simplify;
pub mod substitute_named;

pub use extract_precomputed::{extract_precomputed, query_steps, Computation, Extracted};
pub use fix_top_k_having::fix_top_k_having;
pub use optimize_last::optimize_last;
pub use simplify::simplify;
pub use substitute_named::substitute_named;
