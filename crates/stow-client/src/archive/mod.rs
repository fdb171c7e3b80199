//! Bundle archive format: tar+gzip of a directory tree

pub mod create;
pub mod extract;
pub mod materialize;

pub use create::{create_archive, create_archive_to};
pub use extract::{extract_archive, ExtractStats};
pub use materialize::{ensure_clean_target, materialize};
