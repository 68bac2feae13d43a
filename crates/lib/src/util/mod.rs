//! Shared utilities.
//!
//! Content hashing and tree copying used by the executor and the layer cache.

pub mod fs;
pub mod hash;
