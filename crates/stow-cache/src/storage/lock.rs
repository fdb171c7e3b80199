//! Per-key exclusive locks
//!
//! Two layers: an async mutex per key for tasks in this process, then an
//! advisory `flock` on `locks/<fingerprint>.lock` for other processes
//! sharing the cache directory. The file lock is only attempted while
//! holding the in-process mutex, so a process never contends with itself.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use stow_core::error::{StowError, StowResult};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entry::CacheKey;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONTENTION_WARNING: Duration = Duration::from_millis(500);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

type LockTable = DashMap<CacheKey, Arc<Mutex<()>>>;

/// Table of per-key locks
///
/// Entries exist only while a key is held or awaited.
#[derive(Debug)]
pub struct KeyLocks {
    locks: Arc<LockTable>,
    /// Directory for cross-process lock files; `None` locks in-process only.
    /// It must already exist.
    lock_dir: Option<PathBuf>,
    timeout: Duration,
}

/// Exclusive hold on one key; released on drop
#[derive(Debug)]
pub struct KeyGuard {
    key: CacheKey,
    file: Option<FileLock>,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl KeyGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Whether another process is also excluded
    pub fn is_cross_process(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.file.take();
        self.guard.take();
        release(&self.table, &self.key);
    }
}

/// Drop the table entry for `key` unless someone else holds or awaits it
fn release(table: &LockTable, key: &CacheKey) {
    table.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

impl KeyLocks {
    pub fn in_process() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            lock_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: Some(lock_dir.into()),
            ..Self::in_process()
        }
    }

    /// How long to wait for another process before giving up
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Wait until `key` is free, then hold it
    ///
    /// Gives up with [`StowError::Cancelled`] as soon as `cancel` fires,
    /// including when it has fired before the call.
    pub async fn acquire(&self, key: &CacheKey, cancel: &CancellationToken) -> StowResult<KeyGuard> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let owned = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            owned = mutex.lock_owned() => Some(owned),
        };
        let Some(owned) = owned else {
            release(&self.locks, key);
            return Err(StowError::Cancelled);
        };

        // From here on, dropping the guard cleans up the table entry
        let mut guard = KeyGuard {
            key: key.clone(),
            file: None,
            guard: Some(owned),
            table: self.locks.clone(),
        };
        if let Some(dir) = &self.lock_dir {
            let path = dir.join(format!("{}.lock", key.fingerprint()));
            guard.file = Some(self.acquire_file(key, &path, cancel).await?);
        }
        Ok(guard)
    }

    async fn acquire_file(&self, key: &CacheKey, path: &Path, cancel: &CancellationToken) -> StowResult<FileLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| lock_error(key, format!("Failed to open {}: {}", path.display(), e)))?;

        let start = Instant::now();
        let mut warned = false;

        loop {
            match lock_exclusive_nonblocking(&file) {
                Ok(()) => {
                    if warned {
                        debug!(
                            key = %key,
                            waited_ms = start.elapsed().as_millis() as u64,
                            "Acquired cache lock after contention"
                        );
                    }
                    return Ok(FileLock { file });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > CONTENTION_WARNING {
                        warn!(key = %key, path = %path.display(), "Cache lock held by another process, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(lock_error(key, e.to_string())),
            }

            if start.elapsed() >= self.timeout {
                return Err(lock_error(key, format!("timed out after {:?}", self.timeout)));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(StowError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

fn lock_error(key: &CacheKey, message: String) -> StowError {
    StowError::Lock {
        key: key.to_string(),
        message,
    }
}

/// Advisory lock on an open file; the lock goes away with the descriptor
#[derive(Debug)]
struct FileLock {
    file: File,
}

#[cfg(unix)]
fn lock_exclusive_nonblocking(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn lock_exclusive_nonblocking(_file: &File) -> io::Result<()> {
    // Only the in-process mutex applies here
    Ok(())
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}
