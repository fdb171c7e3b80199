//! Bundle archive creation
//!
//! Paths in the archive are relative to the bundle root with no prefix.
//! Headers are written in deterministic mode, so pushing an unchanged
//! directory yields the same layer digest.

use std::io::Write;
use std::path::Path;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use stow_core::error::StowError;
use tar::{Builder, HeaderMode};
use tracing::debug;
use walkdir::WalkDir;

use crate::ClientResult;

/// Archive `source_dir` as tar+gzip into `writer`
pub fn create_archive_to<W: Write>(writer: W, source_dir: &Path) -> ClientResult<()> {
    let gz_encoder = GzEncoder::new(writer, Compression::default());
    let mut tar_builder = Builder::new(gz_encoder);
    tar_builder.mode(HeaderMode::Deterministic);
    tar_builder.follow_symlinks(false);

    let archive_error =
        |path: &Path, e: std::io::Error| StowError::io(format!("Failed to archive {}", path.display()), e);

    for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source_dir.to_path_buf());
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
            archive_error(&path, io)
        })?;

        let path = entry.path();
        let relative_path = match path.strip_prefix(source_dir) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            // The root directory itself
            _ => continue,
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            tar_builder
                .append_dir(relative_path, path)
                .map_err(|e| archive_error(path, e))?;
        } else if file_type.is_file() || file_type.is_symlink() {
            tar_builder
                .append_path_with_name(path, relative_path)
                .map_err(|e| archive_error(path, e))?;
        } else {
            debug!(path = %path.display(), "Skipping special file");
        }
    }

    let encoder = tar_builder
        .into_inner()
        .map_err(|e| archive_error(source_dir, e))?;
    encoder.finish().map_err(|e| archive_error(source_dir, e))?;
    Ok(())
}

/// Archive `source_dir` into an in-memory payload
pub fn create_archive(source_dir: &Path) -> ClientResult<Bytes> {
    if !source_dir.is_dir() {
        return Err(StowError::invalid_argument(
            "source_dir",
            format!("{} is not a directory", source_dir.display()),
        ));
    }

    let mut buffer = Vec::new();
    create_archive_to(&mut buffer, source_dir)?;
    Ok(Bytes::from(buffer))
}
