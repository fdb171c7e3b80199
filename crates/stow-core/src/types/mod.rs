//! Core data types shared by every stow crate.
//!
//! - References and digests naming registry artifacts
//! - Cache policy selection

pub mod digest;
pub mod policy;
pub mod reference;

// Re-export all public types
pub use digest::Digest;
pub use policy::CachePolicy;
pub use reference::{Reference, DEFAULT_TAG};
