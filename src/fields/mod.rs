//! Field and dataset resolution
//!
//! - **field_set**: a logical field resolved to physical names per dataset
//! - **resolver**: maps the names typed in a query onto the catalog
//!
//! ```text
//!   "Country" ──FieldResolver──▶ { jobsearch: country, mobile: geo_country }
//! ```

pub mod field_set;
pub mod resolver;

pub use field_set::FieldSet;
pub use resolver::{FieldResolver, ScopedFieldResolver, FAILED_TO_RESOLVE_DATASET, FAILED_TO_RESOLVE_FIELD};
