//! # stow-core
//!
//! Core types and utilities shared across all stow crates.
//!
//! This crate provides:
//! - `Reference` and `Digest` naming registry artifacts
//! - `CachePolicy` selecting which operations use the cache
//! - `StowError` for unified error handling
//! - The `Filesystem` abstraction used for all cache and extraction I/O
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `types`: Core data types (Reference, Digest, CachePolicy)
//! - `error`: Error types and result aliases
//! - `fs`: Filesystem trait and the OS-backed implementation
//! - `utils`: Hashing and path helpers

pub mod error;
pub mod fs;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Phase, StowError, StowResult};
pub use fs::{Filesystem, OsFs};
pub use types::{CachePolicy, Digest, Reference};
