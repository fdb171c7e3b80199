//! Shared fixtures for the client integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use stow_client::{create_archive, AuthConfig, Digest, Filesystem, OsFs, Reference, Registry, StowError};
use stow_registry::{Artifact, Descriptor, Manifest, RegistryResult, BUNDLE_LAYER_MEDIA_TYPE};

/// In-memory registry keyed by `registry/repository:tag`
#[derive(Default)]
pub struct MockRegistry {
    tags: Mutex<HashMap<String, Artifact>>,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
    resolves: AtomicUsize,
    pull_delay: Option<Duration>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pull sleeps first, widening race windows
    pub fn with_pull_delay(delay: Duration) -> Self {
        Self {
            pull_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Store a bundle under `reference` as if it had been pushed
    pub fn publish(&self, reference: &str, payload: Bytes) -> Digest {
        let reference: Reference = reference.parse().unwrap();
        let descriptor = Descriptor::new(BUNDLE_LAYER_MEDIA_TYPE, payload);
        self.store(&reference, &descriptor)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    /// Every registry call of any kind
    pub fn calls(&self) -> usize {
        self.pulls() + self.pushes() + self.resolves()
    }

    fn tag_key(reference: &Reference) -> String {
        format!(
            "{}/{}:{}",
            reference.registry(),
            reference.repository(),
            reference.tag().unwrap_or("latest")
        )
    }

    fn store(&self, reference: &Reference, descriptor: &Descriptor) -> Digest {
        let manifest = Bytes::from(Manifest::for_bundle(descriptor).to_bytes().unwrap());
        let manifest_digest = Digest::of(&manifest);
        self.tags.lock().insert(
            Self::tag_key(reference),
            Artifact {
                manifest_digest: manifest_digest.clone(),
                manifest,
                descriptor: descriptor.clone(),
            },
        );
        manifest_digest
    }

    fn lookup(&self, reference: &Reference) -> RegistryResult<Artifact> {
        let tags = self.tags.lock();
        let found = match reference.digest() {
            Some(digest) => tags.values().find(|artifact| artifact.manifest_digest == *digest),
            None => tags.get(&Self::tag_key(reference)),
        };
        found.cloned().ok_or_else(|| StowError::NotFound {
            reference: reference.to_string(),
        })
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn push(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        _auth: Option<&AuthConfig>,
    ) -> RegistryResult<Digest> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(self.store(reference, descriptor))
    }

    async fn pull(&self, reference: &Reference, _auth: Option<&AuthConfig>) -> RegistryResult<Artifact> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.pull_delay {
            tokio::time::sleep(delay).await;
        }
        self.lookup(reference)
    }

    async fn resolve(&self, reference: &Reference, _auth: Option<&AuthConfig>) -> RegistryResult<Digest> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.lookup(reference).map(|artifact| artifact.manifest_digest)
    }
}

/// Write `files` under `dir`, creating parents
pub fn write_tree(dir: &Path, files: &[(&str, &[u8])]) {
    for (path, content) in files {
        let full_path = dir.join(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full_path, content).unwrap();
    }
}

/// A bundle payload holding `files`
pub fn bundle(files: &[(&str, &[u8])]) -> Bytes {
    let temp_dir = tempfile::tempdir().unwrap();
    write_tree(temp_dir.path(), files);
    create_archive(temp_dir.path()).unwrap()
}

/// `len` bytes that gzip cannot shrink
pub fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// Names of the entries directly inside `dir`
pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Delegates to the OS filesystem but fails the nth rename (1-based)
#[derive(Debug)]
pub struct FaultyFs {
    fail_rename_on: usize,
    renames: AtomicUsize,
}

impl FaultyFs {
    pub fn failing_rename(n: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_rename_on: n,
            renames: AtomicUsize::new(0),
        })
    }
}

impl Filesystem for FaultyFs {
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
        let count = self.renames.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.fail_rename_on {
            return Err(io::Error::new(io::ErrorKind::Other, "injected rename failure"));
        }
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
