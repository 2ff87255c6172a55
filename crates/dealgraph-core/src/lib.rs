//! # dealgraph-core
//!
//! Core types, traits, and error taxonomy for the dealgraph ingestion
//! pipeline. Every other dealgraph crate depends on this one.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

pub use error::{is_transient_status, Error, Result};
pub use models::*;
pub use traits::*;

/// Generate a new time-ordered UUIDv7 identifier.
#[inline]
pub fn new_v7() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
