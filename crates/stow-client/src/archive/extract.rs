//! Bundle archive extraction
//!
//! Entries are validated before anything is written: no absolute paths,
//! no `..` climbing out of the destination, no symlinks pointing outside
//! it and no entries placed beneath a symlink. Limits are checked against
//! header sizes before a file's bytes are copied. All writes go through
//! the [`Filesystem`] abstraction.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use stow_core::error::StowError;
use stow_core::utils::{is_hidden, is_safe_path, normalize_path, safe_join, strip_path_prefix};
use stow_core::Filesystem;
use tar::{Archive, EntryType};
use tracing::{debug, warn};

use crate::options::ExtractLimits;
use crate::ClientResult;

/// What an extraction wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Regular files and symlinks
    pub files: u64,
    /// Bytes of regular file content
    pub bytes: u64,
}

impl ExtractStats {
    /// Account for one more file of `size` bytes, failing if that breaks a limit
    fn admit(&mut self, size: u64, limits: &ExtractLimits) -> ClientResult<()> {
        if size > limits.max_file_size {
            return Err(StowError::LimitExceeded {
                limit: "file size".to_string(),
                actual: size,
                max: limits.max_file_size,
            });
        }
        let files = self.files + 1;
        if files > limits.max_files {
            return Err(StowError::LimitExceeded {
                limit: "file count".to_string(),
                actual: files,
                max: limits.max_files,
            });
        }
        let bytes = self.bytes.saturating_add(size);
        if bytes > limits.max_total_size {
            return Err(StowError::LimitExceeded {
                limit: "total size".to_string(),
                actual: bytes,
                max: limits.max_total_size,
            });
        }
        self.files = files;
        self.bytes = bytes;
        Ok(())
    }
}

/// Extract a tar+gzip payload into `dest_dir`
pub fn extract_archive(
    fs: &dyn Filesystem,
    data: &[u8],
    dest_dir: &Path,
    limits: &ExtractLimits,
) -> ClientResult<ExtractStats> {
    let read_error = |e: io::Error| StowError::io("Failed to read bundle archive", e);

    fs.create_dir_all(dest_dir)
        .map_err(|e| StowError::io(format!("Failed to create {}", dest_dir.display()), e))?;

    let mut archive = Archive::new(GzDecoder::new(data));
    let mut stats = ExtractStats::default();
    let mut symlinks = HashSet::new();

    for entry in archive.entries().map_err(read_error)? {
        let mut entry = entry.map_err(read_error)?;
        let raw_path = entry.path().map_err(read_error)?.into_owned();

        let Some(relative) = destination(&raw_path, limits)? else {
            continue;
        };
        if let Some(link) = beneath_symlink(&relative, &symlinks) {
            return Err(unsafe_entry(
                &raw_path,
                format!("path passes through symlink {}", link.display()),
            ));
        }
        let target = safe_join(dest_dir, &relative)?;
        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().ok();

        match entry_type {
            EntryType::Directory => {
                fs.create_dir_all(&target).map_err(|e| write_error(&target, e))?;
            }
            kind if kind.is_file() => {
                stats.admit(entry.size(), limits)?;
                create_parent(fs, &target)?;
                if symlinks.remove(&relative) {
                    // A later file entry replaces an earlier link
                    fs.remove_file(&target).map_err(|e| write_error(&target, e))?;
                }

                let mut file = fs.create_file(&target).map_err(|e| write_error(&target, e))?;
                io::copy(&mut entry, &mut file).map_err(|e| write_error(&target, e))?;
                file.flush().map_err(|e| write_error(&target, e))?;

                if let (true, Some(mode)) = (limits.preserve_permissions, mode) {
                    fs.set_permissions(&target, mode & 0o777)
                        .map_err(|e| write_error(&target, e))?;
                }
            }
            EntryType::Symlink => {
                let link_target = entry
                    .link_name()
                    .map_err(read_error)?
                    .map(|name| name.into_owned())
                    .ok_or_else(|| unsafe_entry(&raw_path, "symlink has no target"))?;
                check_link_target(&raw_path, &relative, &link_target)?;

                stats.admit(0, limits)?;
                create_parent(fs, &target)?;
                fs.symlink(&link_target, &target).map_err(|e| write_error(&target, e))?;
                symlinks.insert(relative);
            }
            EntryType::Link => {
                warn!(path = %raw_path.display(), "Skipping hard link in bundle");
            }
            other => {
                debug!(path = %raw_path.display(), kind = ?other, "Skipping unsupported archive entry");
            }
        }
    }

    Ok(stats)
}

/// Where an archive path lands relative to the destination; `None` to skip it
fn destination(raw_path: &Path, limits: &ExtractLimits) -> ClientResult<Option<PathBuf>> {
    if !is_safe_path(raw_path) {
        return Err(unsafe_entry(raw_path, "path escapes the extraction directory"));
    }

    let normalized = normalize_path(raw_path);
    let relative = match &limits.strip_prefix {
        Some(prefix) => match strip_path_prefix(&normalized, prefix) {
            Some(rest) => rest,
            None => return Ok(None),
        },
        None => normalized,
    };
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }

    if !limits.allow_hidden_files && is_hidden(&relative) {
        return Err(unsafe_entry(raw_path, "hidden files are not allowed"));
    }
    Ok(Some(relative))
}

fn beneath_symlink<'a>(relative: &Path, symlinks: &'a HashSet<PathBuf>) -> Option<&'a PathBuf> {
    relative
        .ancestors()
        .skip(1)
        .find_map(|ancestor| symlinks.get(ancestor))
}

fn check_link_target(raw_path: &Path, relative: &Path, link_target: &Path) -> ClientResult<()> {
    if link_target.is_absolute() {
        return Err(unsafe_entry(raw_path, "symlink target is absolute"));
    }
    let resolved = relative.parent().unwrap_or_else(|| Path::new("")).join(link_target);
    if !is_safe_path(&resolved) || normalize_path(&resolved).as_os_str().is_empty() {
        return Err(unsafe_entry(raw_path, "symlink points outside the extraction directory"));
    }
    Ok(())
}

fn create_parent(fs: &dyn Filesystem, target: &Path) -> ClientResult<()> {
    match target.parent() {
        Some(parent) => fs.create_dir_all(parent).map_err(|e| write_error(parent, e)),
        None => Ok(()),
    }
}

fn unsafe_entry(path: &Path, reason: impl Into<String>) -> StowError {
    StowError::UnsafeEntry {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn write_error(path: &Path, e: io::Error) -> StowError {
    StowError::io(format!("Failed to write {}", path.display()), e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use stow_core::OsFs;
    use tar::{Builder, Header};
    use tempfile::tempdir;

    enum Item<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
        Link(&'a str, &'a str),
    }

    /// Build an archive header by header, bypassing the path checks
    /// `tar::Builder` applies to names
    fn archive(items: &[Item<'_>]) -> Vec<u8> {
        let mut tarball_data = Vec::new();
        {
            let gz_encoder = GzEncoder::new(&mut tarball_data, Compression::default());
            let mut tar_builder = Builder::new(gz_encoder);
            for item in items {
                let mut header = Header::new_gnu();
                let (name, data): (&str, &[u8]) = match item {
                    Item::File(name, data) => {
                        header.set_entry_type(EntryType::Regular);
                        header.set_mode(0o644);
                        (*name, *data)
                    }
                    Item::Dir(name) => {
                        header.set_entry_type(EntryType::Directory);
                        header.set_mode(0o755);
                        (*name, &[])
                    }
                    Item::Link(name, target) => {
                        header.set_entry_type(EntryType::Symlink);
                        header.set_mode(0o777);
                        header.set_link_name(target).unwrap();
                        (*name, &[])
                    }
                };
                let name_field = &mut header.as_old_mut().name;
                name_field[..name.len()].copy_from_slice(name.as_bytes());
                header.set_size(data.len() as u64);
                header.set_cksum();
                tar_builder.append(&header, data).unwrap();
            }
            tar_builder.finish().unwrap();
        }
        tarball_data
    }

    #[test]
    fn test_extract_files_and_directories() {
        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out");
        let data = archive(&[
            Item::Dir("docs"),
            Item::File("docs/readme.md", b"hello"),
            Item::File("main.txt", b"world!"),
        ]);

        let stats = extract_archive(&OsFs, &data, &dest, &ExtractLimits::default()).unwrap();
        assert_eq!(stats, ExtractStats { files: 2, bytes: 11 });
        assert_eq!(fs::read(dest.join("docs/readme.md")).unwrap(), b"hello");
        assert_eq!(fs::read(dest.join("main.txt")).unwrap(), b"world!");
    }

    #[test]
    fn test_parent_traversal_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out");
        let data = archive(&[Item::File("safe/../../escape.txt", b"x")]);

        let err = extract_archive(&OsFs, &data, &dest, &ExtractLimits::default()).unwrap_err();
        assert!(matches!(err, StowError::UnsafeEntry { .. }));
        assert!(!temp_dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_escaping_symlink_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out");
        let data = archive(&[Item::Link("link", "../../etc")]);

        let err = extract_archive(&OsFs, &data, &dest, &ExtractLimits::default()).unwrap_err();
        assert!(matches!(err, StowError::UnsafeEntry { .. }));

        let absolute = archive(&[Item::Link("link", "/etc/passwd")]);
        let err = extract_archive(&OsFs, &absolute, &dest, &ExtractLimits::default()).unwrap_err();
        assert!(matches!(err, StowError::UnsafeEntry { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_entry_beneath_symlink_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out");
        let data = archive(&[
            Item::Dir("real"),
            Item::Link("alias", "real"),
            Item::File("alias/inner.txt", b"x"),
        ]);

        let err = extract_archive(&OsFs, &data, &dest, &ExtractLimits::default()).unwrap_err();
        assert!(err.to_string().contains("symlink alias"));
    }

    #[test]
    fn test_file_count_limit() {
        let temp_dir = tempdir().unwrap();
        let data = archive(&[Item::File("a", b"1"), Item::File("b", b"2"), Item::File("c", b"3")]);
        let limits = ExtractLimits {
            max_files: 2,
            ..ExtractLimits::default()
        };

        let err = extract_archive(&OsFs, &data, temp_dir.path(), &limits).unwrap_err();
        assert!(matches!(err, StowError::LimitExceeded { actual: 3, max: 2, .. }));
    }

    #[test]
    fn test_size_limits() {
        let temp_dir = tempdir().unwrap();
        let data = archive(&[Item::File("a", b"12345"), Item::File("b", b"123456")]);

        let per_file = ExtractLimits {
            max_file_size: 5,
            ..ExtractLimits::default()
        };
        let err = extract_archive(&OsFs, &data, &temp_dir.path().join("one"), &per_file).unwrap_err();
        assert!(err.to_string().contains("file size"));

        let total = ExtractLimits {
            max_total_size: 10,
            ..ExtractLimits::default()
        };
        let err = extract_archive(&OsFs, &data, &temp_dir.path().join("two"), &total).unwrap_err();
        assert!(err.to_string().contains("total size"));
    }

    #[test]
    fn test_hidden_files_policy() {
        let temp_dir = tempdir().unwrap();
        let data = archive(&[Item::File("config/.env", b"SECRET=1")]);

        extract_archive(&OsFs, &data, &temp_dir.path().join("allowed"), &ExtractLimits::default()).unwrap();
        assert!(temp_dir.path().join("allowed/config/.env").exists());

        let strict = ExtractLimits {
            allow_hidden_files: false,
            ..ExtractLimits::default()
        };
        let err = extract_archive(&OsFs, &data, &temp_dir.path().join("strict"), &strict).unwrap_err();
        assert!(matches!(err, StowError::UnsafeEntry { .. }));
    }

    #[test]
    fn test_strip_prefix() {
        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out");
        let data = archive(&[
            Item::File("package/lib/index.js", b"code"),
            Item::File("package/README", b"docs"),
            Item::File("other/skipped", b"nope"),
        ]);
        let limits = ExtractLimits {
            strip_prefix: Some(PathBuf::from("package")),
            ..ExtractLimits::default()
        };

        let stats = extract_archive(&OsFs, &data, &dest, &limits).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(fs::read(dest.join("lib/index.js")).unwrap(), b"code");
        assert_eq!(fs::read(dest.join("README")).unwrap(), b"docs");
        assert!(!dest.join("other").exists());
        assert!(!dest.join("package").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_are_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out");
        let payload = {
            let source = temp_dir.path().join("source");
            fs::create_dir_all(&source).unwrap();
            fs::write(source.join("run.sh"), "#!/bin/sh\n").unwrap();
            fs::set_permissions(source.join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
            crate::archive::create_archive(&source).unwrap()
        };

        extract_archive(&OsFs, &payload, &dest, &ExtractLimits::default()).unwrap();
        let mode = fs::metadata(dest.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
