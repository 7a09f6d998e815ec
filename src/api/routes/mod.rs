//! API Routes
//!
//! Route handlers organized by functionality.

pub mod compile;
pub mod datasets;
pub mod health;
