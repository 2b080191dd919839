//! Shared types for the fitness prediction proxy.
//!
//! Kept free of runtime dependencies so the HTTP layer, the job driver and
//! tests all agree on one vocabulary for outcomes and error bodies.

pub mod api;
pub mod resolution;

pub use api::*;
pub use resolution::*;
