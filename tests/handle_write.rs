#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::time::SystemTime;

use common::{create, mount, mount_with, read_file};
use remote_vfs::backend::MemoryBackend;
use remote_vfs::backend::memory::FailPoint;
use remote_vfs::cache::CacheMode;
use remote_vfs::fs::{OpenFlags, VfsError};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_writes_stream_one_object() {
    let t = mount(CacheMode::Off);
    let mut handle = create(&t, "log").await.unwrap();
    for chunk in [&b"first "[..], b"second ", b"third"] {
        assert_eq!(handle.write(chunk).await.unwrap(), chunk.len());
    }
    assert_eq!(t.open_writers(), 1);
    handle.close().await.unwrap();

    assert_eq!(t.open_writers(), 0);
    assert_eq!(t.backend.puts(), 1);
    assert_eq!(
        t.backend.contents("log").unwrap().as_ref(),
        b"first second third"
    );
    assert_eq!(t.stat("log").await.unwrap().attr().size, 18);
    assert!(t.cache().staging().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_at_must_continue_where_the_last_one_stopped() {
    let t = mount(CacheMode::Off);
    let mut handle = create(&t, "f").await.unwrap();
    handle.write_at(b"abc", 0).await.unwrap();
    assert!(matches!(
        handle.write_at(b"x", 10).await,
        Err(VfsError::Unsupported)
    ));
    assert!(matches!(
        handle.write_at(b"x", 1).await,
        Err(VfsError::Unsupported)
    ));
    handle.write_at(b"def", 3).await.unwrap();
    handle.close().await.unwrap();
    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"abcdef");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_writer_is_rejected() {
    let t = mount(CacheMode::Off);
    let mut first = create(&t, "f").await.unwrap();
    assert!(matches!(
        create(&t, "f").await,
        Err(VfsError::PermissionDenied)
    ));
    first.write(b"only").await.unwrap();
    first.close().await.unwrap();

    // Once the first writer is gone another may replace the object.
    let mut second = create(&t, "f").await.unwrap();
    second.write(b"again").await.unwrap();
    second.close().await.unwrap();
    assert_eq!(read_file(&t, "f").await.unwrap(), b"again");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_completes_the_upload() {
    let t = mount(CacheMode::Off);
    let mut handle = create(&t, "f").await.unwrap();
    handle.write(b"flushed").await.unwrap();
    handle.flush().await.unwrap();
    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"flushed");

    assert!(matches!(handle.write(b"more").await, Err(VfsError::Closed)));
    handle.close().await.unwrap();
    assert_eq!(t.backend.puts(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn created_and_closed_without_writes_is_empty_object() {
    let t = mount(CacheMode::Off);
    let mut handle = create(&t, "empty").await.unwrap();
    handle.close().await.unwrap();
    assert_eq!(t.backend.contents("empty").unwrap().len(), 0);
    assert_eq!(read_file(&t, "empty").await.unwrap(), b"");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_upload_is_reported_on_close() {
    let t = mount(CacheMode::Off);
    t.backend.fail_next(FailPoint::Put, 1);
    let mut handle = create(&t, "f").await.unwrap();
    handle.write(b"lost").await.unwrap();
    assert!(matches!(
        handle.close().await,
        Err(VfsError::BackendTransient(_))
    ));
    assert!(t.backend.contents("f").is_none());
    assert_eq!(t.open_writers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_only_at_the_current_offset() {
    let t = mount(CacheMode::Off);
    let mut handle = create(&t, "f").await.unwrap();
    handle.write(b"1234").await.unwrap();
    handle.truncate(4).await.unwrap();
    assert!(matches!(
        handle.truncate(2).await,
        Err(VfsError::Unsupported)
    ));
    handle.close().await.unwrap();
    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"1234");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_handle_stores_nothing() {
    let t = mount(CacheMode::Off);
    let mut handle = create(&t, "f").await.unwrap();
    handle.write(b"partial").await.unwrap();
    drop(handle);

    assert_eq!(t.open_writers(), 0);
    assert!(t.wait_for_writers(std::time::Duration::from_millis(10)).await);
    assert!(t.backend.contents("f").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replacing_an_existing_object_requires_truncate() {
    let backend = MemoryBackend::new();
    backend.external_put("f", "old", SystemTime::now());
    let t = mount_with(backend, CacheMode::Off, |_| {});

    let mut handle = t
        .open_file("f", OpenFlags::WRONLY | OpenFlags::TRUNC, 0)
        .await
        .unwrap();
    handle.write(b"new").await.unwrap();
    handle.close().await.unwrap();
    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"new");
}
