//! A failed pull never leaves a half-written target behind

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use common::{bundle, entries, FaultyFs, MockRegistry};
use stow_client::{
    CacheConfig, CacheOptions, CancellationToken, Client, ExtractLimits, MemoryCache, Phase, PullOptions, StowError,
};
use tempfile::tempdir;

const APP: &str = "registry.test/team/app:v1";

fn sample() -> bytes::Bytes {
    bundle(&[
        ("one.txt", b"1"),
        ("two.txt", b"22"),
        ("nested/three.txt", b"333"),
        (".hidden/four.txt", b"4444"),
    ])
}

#[tokio::test]
async fn test_limit_failure_leaves_target_untouched() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(MockRegistry::new());
    registry.publish(APP, sample());
    let client = Client::builder().registry(registry.clone()).build().unwrap();
    let target = temp_dir.path().join("target");
    fs::create_dir(&target).unwrap();

    let limits = ExtractLimits {
        max_files: 3,
        ..ExtractLimits::default()
    };
    let err = client
        .pull(&CancellationToken::new(), APP, &target, PullOptions::default().limits(limits))
        .await
        .unwrap_err();

    assert!(matches!(err, StowError::Transfer { phase: Phase::Extract, .. }));
    assert!(matches!(err.root(), StowError::LimitExceeded { .. }));
    assert!(entries(&target).is_empty());
    assert_eq!(entries(temp_dir.path()), vec!["target".to_string()]);
}

#[tokio::test]
async fn test_hidden_files_can_be_refused() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(MockRegistry::new());
    registry.publish(APP, sample());
    let strict = ExtractLimits {
        allow_hidden_files: false,
        ..ExtractLimits::default()
    };
    let client = Client::builder()
        .registry(registry.clone())
        .limits(strict)
        .build()
        .unwrap();
    let target = temp_dir.path().join("target");

    let err = client
        .pull(&CancellationToken::new(), APP, &target, PullOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), StowError::UnsafeEntry { .. }));
    assert!(!target.exists());
}

#[tokio::test]
async fn test_rename_failure_rolls_back() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(MockRegistry::new());
    registry.publish(APP, sample());
    let client = Client::builder()
        .registry(registry.clone())
        .filesystem(FaultyFs::failing_rename(3))
        .build()
        .unwrap();
    let target = temp_dir.path().join("target");
    fs::create_dir(&target).unwrap();

    let err = client
        .pull(&CancellationToken::new(), APP, &target, PullOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), StowError::Io { .. }));
    assert!(entries(&target).is_empty());
    assert_eq!(entries(temp_dir.path()), vec!["target".to_string()]);
}

#[tokio::test]
async fn test_rename_failure_on_cache_hit_rolls_back() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(MockRegistry::new());
    registry.publish(APP, sample());
    let cache = Arc::new(MemoryCache::new(CacheOptions::default()));
    let cancel = CancellationToken::new();

    let warm = Client::builder()
        .registry(registry.clone())
        .with_cache(CacheConfig::with_coordinator(cache.clone()))
        .build()
        .unwrap();
    warm.pull_with_cache(&cancel, APP, temp_dir.path().join("warm"), PullOptions::default())
        .await
        .unwrap();

    let client = Client::builder()
        .registry(registry.clone())
        .with_cache(CacheConfig::with_coordinator(cache))
        .filesystem(FaultyFs::failing_rename(1))
        .build()
        .unwrap();
    let target = temp_dir.path().join("target");

    let err = client
        .pull_with_cache(&cancel, APP, &target, PullOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err.root(), StowError::Io { .. }));
    assert!(!target.exists());
    assert_eq!(registry.pulls(), 1);
}

#[tokio::test]
async fn test_non_empty_target_is_refused_before_download() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(MockRegistry::new());
    registry.publish(APP, sample());
    let client = Client::builder().registry(registry.clone()).build().unwrap();
    let target = temp_dir.path().join("target");
    fs::create_dir(&target).unwrap();
    fs::write(target.join("mine.txt"), "keep me").unwrap();

    let err = client
        .pull(&CancellationToken::new(), APP, &target, PullOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StowError::TargetNotEmpty { .. }));
    assert_eq!(registry.pulls(), 0);
    assert_eq!(fs::read_to_string(target.join("mine.txt")).unwrap(), "keep me");
}

#[tokio::test]
async fn test_strip_prefix_reroots_entries() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(MockRegistry::new());
    registry.publish(APP, sample());
    let client = Client::builder().registry(registry.clone()).build().unwrap();
    let target = temp_dir.path().join("target");

    let limits = ExtractLimits {
        strip_prefix: Some(PathBuf::from("nested")),
        ..ExtractLimits::default()
    };
    let report = client
        .pull(&CancellationToken::new(), APP, &target, PullOptions::default().limits(limits))
        .await
        .unwrap();
    assert_eq!(report.files, 1);
    assert_eq!(entries(&target), vec!["three.txt".to_string()]);
}

#[tokio::test]
async fn test_missing_artifact_is_a_download_error() {
    let temp_dir = tempdir().unwrap();
    let registry = Arc::new(MockRegistry::new());
    let client = Client::builder().registry(registry.clone()).build().unwrap();

    let err = client
        .pull(&CancellationToken::new(), APP, temp_dir.path().join("target"), PullOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StowError::Transfer { phase: Phase::Download, .. }));
    assert!(matches!(err.root(), StowError::NotFound { .. }));
    assert!(err.suggestion().is_some());
}
