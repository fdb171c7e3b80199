//! Unit tests for the on-disk cache

use super::*;

use crate::clock::ManualClock;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::{tempdir, TempDir};

const LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

fn key(tag: &str) -> CacheKey {
    CacheKey::pull(&format!("registry.test/app:{}", tag).parse().unwrap())
}

fn entry(data: &[u8]) -> Entry {
    let manifest = [b"manifest-".as_slice(), data].concat();
    Entry::new(Digest::of(&manifest), LAYER, manifest, data.to_vec())
}

fn options(max_size_bytes: u64) -> CacheOptions {
    CacheOptions {
        max_size_bytes,
        default_ttl: Duration::from_secs(3600),
        manifest_ttl: Duration::from_secs(300),
    }
}

fn open(dir: &TempDir, clock: &Arc<ManualClock>, max: u64) -> DiskCache {
    DiskCache::open_with(dir.path(), options(max), Arc::new(OsFs), clock.clone()).unwrap()
}

#[tokio::test]
async fn test_put_then_get() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);

    let stored = entry(b"bundle");
    cache.put(&key("v1"), stored.clone()).await.unwrap();

    let found = cache.get(&key("v1")).await.unwrap();
    assert_eq!(found.data(), stored.data());
    assert_eq!(found.size(), 6);
    assert_eq!(found.resolved_digest, stored.resolved_digest);
    assert_eq!(found.manifest, stored.manifest);
    assert_eq!(found.created_at, clock.now());
    assert_eq!(found.expires_at, clock.now() + chrono::Duration::hours(1));
    assert!(!found.needs_revalidation);
    assert_eq!(cache.size().await.unwrap(), 6);
}

#[tokio::test]
async fn test_missing_key_is_a_miss() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);

    let err = cache.get(&key("absent")).await.unwrap_err();
    assert!(matches!(err, StowError::CacheMiss { .. }));
}

#[tokio::test]
async fn test_ttl_boundary() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);
    cache.put(&key("v1"), entry(b"bundle")).await.unwrap();

    clock.advance(Duration::from_secs(3600) - Duration::from_millis(1));
    assert!(cache.get(&key("v1")).await.is_ok());

    clock.advance(Duration::from_millis(2));
    let err = cache.get(&key("v1")).await.unwrap_err();
    assert!(matches!(err, StowError::CacheExpired { .. }));
    assert_eq!(cache.size().await.unwrap(), 0);

    // Lazy expiry removed the record
    assert!(matches!(
        cache.get(&key("v1")).await,
        Err(StowError::CacheMiss { .. })
    ));
}

#[tokio::test]
async fn test_manifest_ttl_marks_revalidation() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);
    cache.put(&key("v1"), entry(b"bundle")).await.unwrap();
    let expires_at = cache.get(&key("v1")).await.unwrap().expires_at;

    clock.advance(Duration::from_secs(301));
    let stale = cache.get(&key("v1")).await.unwrap();
    assert!(stale.needs_revalidation);

    cache.revalidate(&key("v1")).await.unwrap();
    let fresh = cache.get(&key("v1")).await.unwrap();
    assert!(!fresh.needs_revalidation);
    assert_eq!(fresh.expires_at, expires_at);
}

#[tokio::test]
async fn test_revalidate_missing_key() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);

    let err = cache.revalidate(&key("absent")).await.unwrap_err();
    assert!(err.is_cache_miss());
}

#[tokio::test]
async fn test_shared_blob_counts_once() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);

    cache.put(&key("v1"), entry(b"same bytes")).await.unwrap();
    cache.put(&key("latest"), entry(b"same bytes")).await.unwrap();
    assert_eq!(cache.size().await.unwrap(), 10);
    assert_eq!(cache.stats().blobs, 1);
    assert_eq!(cache.stats().manifests, 2);

    // The other key still needs the blob
    cache.delete(&key("v1")).await.unwrap();
    assert!(cache.get(&key("latest")).await.is_ok());
    assert_eq!(cache.size().await.unwrap(), 10);

    cache.delete(&key("latest")).await.unwrap();
    assert_eq!(cache.size().await.unwrap(), 0);
    assert_eq!(cache.stats().blobs, 0);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);

    cache.put(&key("v1"), entry(b"bundle")).await.unwrap();
    cache.delete(&key("v1")).await.unwrap();
    cache.delete(&key("v1")).await.unwrap();
    cache.delete(&key("never")).await.unwrap();
    assert!(cache.get(&key("v1")).await.unwrap_err().is_cache_miss());
}

#[tokio::test]
async fn test_replacing_entry_drops_old_blob() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);

    cache.put(&key("v1"), entry(b"first version")).await.unwrap();
    cache.put(&key("v1"), entry(b"second")).await.unwrap();

    assert_eq!(cache.size().await.unwrap(), 6);
    assert_eq!(cache.stats().blobs, 1);
    assert_eq!(cache.get(&key("v1")).await.unwrap().data().as_ref(), b"second");
}

#[tokio::test]
async fn test_put_evicts_least_recently_used() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 100);

    cache.put(&key("a"), entry(&[b'a'; 40])).await.unwrap();
    clock.advance(Duration::from_secs(1));
    cache.put(&key("b"), entry(&[b'b'; 40])).await.unwrap();
    clock.advance(Duration::from_secs(1));
    // Touch "a" so "b" becomes the oldest
    cache.get(&key("a")).await.unwrap();
    clock.advance(Duration::from_secs(1));
    cache.put(&key("c"), entry(&[b'c'; 40])).await.unwrap();

    assert!(cache.size().await.unwrap() <= 100);
    assert!(cache.get(&key("a")).await.is_ok());
    assert!(cache.get(&key("b")).await.unwrap_err().is_cache_miss());
    assert!(cache.get(&key("c")).await.is_ok());
}

#[tokio::test]
async fn test_entry_larger_than_budget_is_rejected() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 16);

    let err = cache.put(&key("big"), entry(&[0u8; 17])).await.unwrap_err();
    assert!(matches!(err, StowError::EntryTooLarge { size: 17, limit: 16 }));
    assert_eq!(cache.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_corrupt_blob_is_a_miss_and_removed() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);
    let stored = entry(b"pristine");
    cache.put(&key("v1"), stored.clone()).await.unwrap();

    let layout = CacheLayout::new(dir.path());
    std::fs::write(layout.blob_path(&stored.digest), b"mangled!").unwrap();

    let err = cache.get(&key("v1")).await.unwrap_err();
    assert!(matches!(err, StowError::CacheCorrupt { .. }));
    assert!(matches!(
        cache.get(&key("v1")).await,
        Err(StowError::CacheMiss { .. })
    ));
    assert!(!layout.blob_path(&stored.digest).exists());
}

#[tokio::test]
async fn test_reopen_rebuilds_index() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    {
        let cache = open(&dir, &clock, 1024);
        cache.put(&key("v1"), entry(b"persisted")).await.unwrap();
        cache.put(&key("v2"), entry(b"also persisted")).await.unwrap();
    }

    let cache = open(&dir, &clock, 1024);
    assert_eq!(cache.size().await.unwrap(), 9 + 14);
    assert_eq!(cache.get(&key("v1")).await.unwrap().data().as_ref(), b"persisted");
}

#[tokio::test]
async fn test_open_drops_record_without_blob() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let stored = entry(b"bundle");
    {
        let cache = open(&dir, &clock, 1024);
        cache.put(&key("v1"), stored.clone()).await.unwrap();
    }
    let layout = CacheLayout::new(dir.path());
    std::fs::remove_file(layout.sidecar_path(&stored.digest)).unwrap();
    std::fs::remove_file(layout.blob_path(&stored.digest)).unwrap();

    let cache = open(&dir, &clock, 1024);
    assert_eq!(cache.stats().manifests, 0);
    assert!(!layout.record_path(&key("v1")).exists());
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);
    cache.put(&key("v1"), entry(b"one")).await.unwrap();
    cache.put(&key("v2"), entry(b"two")).await.unwrap();

    cache.clear().await.unwrap();
    assert_eq!(cache.size().await.unwrap(), 0);
    assert!(cache.get(&key("v1")).await.unwrap_err().is_cache_miss());

    // Still usable afterwards
    cache.put(&key("v3"), entry(b"three")).await.unwrap();
    assert!(cache.get(&key("v3")).await.is_ok());
}

#[tokio::test]
async fn test_prune_expired() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);
    cache.put(&key("old"), entry(b"old bytes")).await.unwrap();
    clock.advance(Duration::from_secs(1800));
    cache.put(&key("new"), entry(b"new bytes")).await.unwrap();
    clock.advance(Duration::from_secs(1801));

    let result = cache.prune_expired().await.unwrap();
    assert_eq!(result.entries_removed, 2);
    assert_eq!(result.freed_space, 9);
    assert!(cache.get(&key("new")).await.is_ok());
    assert_eq!(cache.stats().manifests, 1);
}

#[tokio::test]
async fn test_lock_serializes_holders() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = Arc::new(open(&dir, &clock, 1024));

    let cancel = CancellationToken::new();
    let guard = cache.lock(&key("v1"), &cancel).await.unwrap();
    let waiter = {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.lock(&key("v1"), &cancel).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(guard);
    waiter.await.unwrap().unwrap();
}

/// Delegates to the OS; reading blob content takes a while
#[derive(Debug)]
struct SlowReadFs;

impl Filesystem for SlowReadFs {
    fn exists(&self, path: &Path) -> bool {
        OsFs.exists(path)
    }
    fn is_dir(&self, path: &Path) -> bool {
        OsFs.is_dir(path)
    }
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        OsFs.read_dir(path)
    }
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        OsFs.create_dir(path)
    }
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        OsFs.create_dir_all(path)
    }
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        OsFs.rename(from, to)
    }
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        OsFs.remove_file(path)
    }
    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        OsFs.remove_dir(path)
    }
    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        OsFs.remove_dir_all(path)
    }
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            std::thread::sleep(Duration::from_millis(300));
        }
        OsFs.read(path)
    }
    fn write_new_synced(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        OsFs.write_new_synced(path, data)
    }
    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        OsFs.sync_dir(path)
    }
    fn create_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        OsFs.create_file(path)
    }
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        OsFs.symlink(target, link)
    }
    fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        OsFs.set_permissions(path, mode)
    }
    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        OsFs.modified(path)
    }
}

#[tokio::test]
async fn test_slow_reads_do_not_stall_other_tasks() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = DiskCache::open_with(dir.path(), options(1024), Arc::new(SlowReadFs), clock.clone()).unwrap();
    cache.put(&key("v1"), entry(b"bundle")).await.unwrap();

    // Single-threaded runtime: the ticker only advances if the read
    // happens off this thread
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = ticks.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let found = cache.get(&key("v1")).await.unwrap();
    ticker.abort();

    assert_eq!(found.data().as_ref(), b"bundle");
    assert!(ticks.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_cancelled_lock_leaves_holder_alone() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&dir, &clock, 1024);

    let _held = cache.lock(&key("v1"), &CancellationToken::new()).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let waited = tokio::time::timeout(Duration::from_secs(1), cache.lock(&key("v1"), &cancel)).await;
    assert!(matches!(waited, Ok(Err(StowError::Cancelled))));
}
