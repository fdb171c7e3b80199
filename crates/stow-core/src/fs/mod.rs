//! Filesystem abstraction.
//!
//! Cache storage and extraction go through [`Filesystem`] rather than
//! calling `std::fs` directly, so tests can inject faults (a rename that
//! fails halfway through a move, a full disk) without touching the OS.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Number of attempts at finding an unused temp directory name
const TEMP_DIR_ATTEMPTS: usize = 8;

/// Directory and file operations used by the cache and the client
pub trait Filesystem: Send + Sync + fmt::Debug {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Immediate children of a directory, in no particular order
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Create a single directory; fails if it already exists
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Create a new file (never truncating an existing one), write and fsync it
    fn write_new_synced(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Flush directory metadata so a completed rename survives a crash
    fn sync_dir(&self, path: &Path) -> io::Result<()>;

    /// Create or truncate a file for streaming writes
    fn create_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn modified(&self, path: &Path) -> io::Result<SystemTime>;

    /// Create a fresh, uniquely named directory inside `parent`
    fn create_temp_dir(&self, parent: &Path, prefix: &str) -> io::Result<PathBuf> {
        for _ in 0..TEMP_DIR_ATTEMPTS {
            let candidate = parent.join(temp_name(prefix));
            match self.create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free temp directory name under {}", parent.display()),
        ))
    }
}

/// A unique file name with the given prefix
pub fn temp_name(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

/// [`Filesystem`] backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl Filesystem for OsFs {
    fn exists(&self, path: &Path) -> bool {
        // symlink_metadata so dangling links still count as present
        fs::symlink_metadata(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write_new_synced(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(data)?;
        file.sync_all()
    }

    #[cfg(unix)]
    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        fs::File::open(path)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn create_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(fs::File::create(path)?))
    }

    #[cfg(unix)]
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &Path, link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("symlinks are not supported here: {}", link.display()),
        ))
    }

    #[cfg(unix)]
    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn set_permissions(&self, _path: &Path, _mode: u32) -> io::Result<()> {
        Ok(())
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::symlink_metadata(path)?.modified()
    }
}
