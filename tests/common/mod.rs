#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use remote_vfs::backend::MemoryBackend;
use remote_vfs::cache::CacheMode;
use remote_vfs::fs::{Handle, OpenFlags, Vfs, VfsError, VfsOptions};
use tempfile::TempDir;

/// Every cache mode, least buffering first.
pub const ALL_MODES: [CacheMode; 4] = [
    CacheMode::Off,
    CacheMode::Minimal,
    CacheMode::Writes,
    CacheMode::Full,
];

/// A [`Vfs`] over a [`MemoryBackend`] the test keeps a handle on, staging into a temp dir.
pub struct TestVfs {
    pub vfs: Vfs,
    pub backend: MemoryBackend,
    _cache_dir: TempDir,
}

impl std::ops::Deref for TestVfs {
    type Target = Vfs;

    fn deref(&self) -> &Vfs {
        &self.vfs
    }
}

/// Options suitable for tests: staging in `cache_dir`, no background cleaner.
pub fn test_options(cache_dir: &TempDir, mode: CacheMode) -> VfsOptions {
    VfsOptions {
        cache_mode: mode,
        cache_dir: cache_dir.path().join("staging"),
        cache_poll_interval: Duration::ZERO,
        write_wait: Duration::from_secs(1),
        ..VfsOptions::default()
    }
}

pub fn mount(mode: CacheMode) -> TestVfs {
    mount_with(MemoryBackend::new(), mode, |_| {})
}

pub fn mount_with(
    backend: MemoryBackend,
    mode: CacheMode,
    tweak: impl FnOnce(&mut VfsOptions),
) -> TestVfs {
    let cache_dir = tempfile::tempdir().unwrap();
    let mut options = test_options(&cache_dir, mode);
    tweak(&mut options);
    let vfs = Vfs::new(Arc::new(backend.clone()), options);
    TestVfs {
        vfs,
        backend,
        _cache_dir: cache_dir,
    }
}

pub async fn create(vfs: &Vfs, path: &str) -> Result<Handle, VfsError> {
    vfs.open_file(
        path,
        OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC,
        0o644,
    )
    .await
}

/// Create or replace `path` with `data` and close it.
pub async fn write_file(vfs: &Vfs, path: &str, data: &[u8]) -> Result<(), VfsError> {
    let mut handle = create(vfs, path).await?;
    let mut written = 0;
    while written < data.len() {
        written += handle.write(&data[written..]).await?;
    }
    handle.close().await
}

/// Drain a handle from its current offset.
pub async fn read_to_end(handle: &mut Handle) -> Result<Vec<u8>, VfsError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = handle.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Open `path` read-only, read it whole, and close it.
pub async fn read_file(vfs: &Vfs, path: &str) -> Result<Vec<u8>, VfsError> {
    let mut handle = vfs.open_file(path, OpenFlags::RDONLY, 0).await?;
    let data = read_to_end(&mut handle).await?;
    handle.close().await?;
    Ok(data)
}

/// Names of the children of `path`, in listing order.
pub async fn names(vfs: &Vfs, path: &str) -> Vec<String> {
    vfs.read_dir_all(path)
        .await
        .unwrap()
        .iter()
        .map(remote_vfs::fs::Node::name)
        .collect()
}

/// Retry `check` until it holds, or panic after about a second.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{what} did not happen within 1 second");
}
