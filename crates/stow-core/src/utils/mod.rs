//! Utility functions and helpers.
//!
//! Common functionality used across multiple stow crates.

pub mod hash;
pub mod path;

// Re-export commonly used utilities
pub use hash::{blake3_hash, fingerprint, verify_checksum};
pub use path::{is_hidden, is_safe_path, normalize_path, safe_join, strip_path_prefix};
