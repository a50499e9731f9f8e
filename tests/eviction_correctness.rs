#![allow(clippy::unwrap_used, missing_docs)]

use std::time::Duration;

use remote_vfs::cache::{CacheEngine, CacheMode};
use remote_vfs::fs::{Inode, VfsOptions};
use tempfile::TempDir;

fn engine(dir: &TempDir, max_size: u64) -> CacheEngine {
    CacheEngine::new(&VfsOptions {
        cache_mode: CacheMode::Full,
        cache_dir: dir.path().join("staging"),
        cache_max_size: Some(max_size),
        cache_max_age: None,
        cache_poll_interval: Duration::ZERO,
        ..VfsOptions::default()
    })
}

/// Open a copy of `inode`, fill it with `data` and let it go idle.
async fn stage(engine: &CacheEngine, inode: Inode, data: &[u8]) {
    let acquired = engine.acquire(inode).await.unwrap();
    tokio::fs::write(acquired.entry.path(), data).await.unwrap();
    acquired.entry.set_staged_len(data.len() as u64);
    engine.release(&acquired.entry);
}

fn staged(engine: &CacheEngine, inodes: &[Inode]) -> Vec<Inode> {
    inodes
        .iter()
        .copied()
        .filter(|&i| engine.staging().contains(i))
        .collect()
}

#[tokio::test]
async fn coldest_copy_is_evicted_first() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, 8);
    for inode in [10, 11, 12] {
        stage(&engine, inode, b"abcd").await;
    }
    assert_eq!(engine.staging().tracker().estimated_size(), 12);

    engine.enforce_limits().await;

    assert_eq!(staged(&engine, &[10, 11, 12]), vec![11, 12]);
    assert_eq!(engine.staging().tracker().estimated_size(), 8);
}

#[tokio::test]
async fn reopening_a_copy_makes_it_recent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, 8);
    for inode in [10, 11, 12] {
        stage(&engine, inode, b"abcd").await;
    }
    stage(&engine, 10, b"abcd").await;

    engine.enforce_limits().await;

    assert_eq!(staged(&engine, &[10, 11, 12]), vec![10, 12]);
}

#[tokio::test]
async fn copies_in_use_survive_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, 0);
    for inode in [10, 11, 12] {
        stage(&engine, inode, b"abcd").await;
    }
    let held = engine.acquire(10).await.unwrap();

    engine.enforce_limits().await;
    assert_eq!(staged(&engine, &[10, 11, 12]), vec![10]);
    assert!(held.entry.path().exists());

    engine.release(&held.entry);
    engine.enforce_limits().await;
    assert!(engine.staging().is_empty());
    assert!(!held.entry.path().exists());
    assert_eq!(engine.staging().tracker().estimated_size(), 0);
}

#[tokio::test]
async fn copies_with_unsaved_changes_are_never_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, 4);

    let dirty = engine.acquire(10).await.unwrap();
    tokio::fs::write(dirty.entry.path(), b"unsaved!").await.unwrap();
    dirty.entry.set_staged_len(8);
    engine.set_pinned(10, true);
    engine.release(&dirty.entry);
    for inode in [11, 12] {
        stage(&engine, inode, b"abcd").await;
    }
    // Pinned copies are not eviction candidates, so they do not count against the limit.
    assert_eq!(engine.staging().tracker().estimated_size(), 8);

    engine.enforce_limits().await;

    assert_eq!(staged(&engine, &[10, 11, 12]), vec![10, 12]);
    assert_eq!(
        tokio::fs::read(dirty.entry.path()).await.unwrap(),
        b"unsaved!"
    );
}

#[tokio::test]
async fn idle_copies_past_the_age_limit_are_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let engine = CacheEngine::new(&VfsOptions {
        cache_mode: CacheMode::Full,
        cache_dir: dir.path().join("staging"),
        cache_max_age: Some(Duration::from_millis(20)),
        cache_poll_interval: Duration::ZERO,
        ..VfsOptions::default()
    });
    stage(&engine, 10, b"old").await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    stage(&engine, 11, b"new").await;

    engine.enforce_limits().await;

    assert_eq!(staged(&engine, &[10, 11]), vec![11]);
}

#[tokio::test]
async fn lower_modes_do_not_keep_idle_copies() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, 1024);
    engine.set_mode(CacheMode::Writes);

    stage(&engine, 10, b"abcd").await;

    assert!(engine.staging().is_empty());
    assert_eq!(engine.staging().tracker().estimated_size(), 0);
}
