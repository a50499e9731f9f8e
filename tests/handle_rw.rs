#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::io::SeekFrom;
use std::time::SystemTime;

use common::{create, mount, mount_with, read_file, read_to_end, write_file};
use remote_vfs::backend::MemoryBackend;
use remote_vfs::backend::memory::FailPoint;
use remote_vfs::cache::CacheMode;
use remote_vfs::fs::{OpenFlags, VfsError};

fn rw_create() -> OpenFlags {
    OpenFlags::RDWR | OpenFlags::CREAT
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_writers_on_a_new_file_make_one_object() {
    for mode in [CacheMode::Minimal, CacheMode::Writes, CacheMode::Full] {
        let t = mount(mode);
        let mut a = t.open_file("f", rw_create(), 0o644).await.unwrap();
        let mut b = t.open_file("f", rw_create(), 0o644).await.unwrap();

        a.write_at(b"hello**", 0).await.unwrap();
        b.write_at(b" world", 5).await.unwrap();
        a.close().await.unwrap();
        assert_eq!(t.backend.puts(), 0, "mode {mode}: upload waits for the last writer");
        b.close().await.unwrap();

        assert_eq!(t.backend.puts(), 1, "mode {mode}");
        assert_eq!(t.backend.object_paths(), vec!["f"]);
        assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"hello world");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_flush_uploads_once() {
    let t = mount(CacheMode::Writes);
    let mut handle = create(&t, "f").await.unwrap();
    handle.write(b"content").await.unwrap();
    handle.flush().await.unwrap();
    handle.flush().await.unwrap();
    assert_eq!(t.backend.puts(), 1);

    handle.write(b" more").await.unwrap();
    handle.flush().await.unwrap();
    handle.close().await.unwrap();
    assert_eq!(t.backend.puts(), 2);
    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"content more");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mixing_reads_and_writes_needs_writes_mode() {
    let t = mount(CacheMode::Minimal);
    write_file(&t, "f", b"abcdef").await.unwrap();
    let mut handle = t.open_file("f", OpenFlags::RDWR, 0).await.unwrap();
    handle.write_at(b"X", 0).await.unwrap();
    let mut buf = [0u8; 6];
    assert!(matches!(
        handle.read_at(&mut buf, 0).await,
        Err(VfsError::PermissionDenied)
    ));
    handle.close().await.unwrap();
    assert_eq!(read_file(&t, "f").await.unwrap(), b"Xbcdef");

    let t = mount(CacheMode::Writes);
    write_file(&t, "f", b"abcdef").await.unwrap();
    let mut handle = t.open_file("f", OpenFlags::RDWR, 0).await.unwrap();
    handle.write_at(b"X", 0).await.unwrap();
    assert_eq!(handle.read_at(&mut buf, 0).await.unwrap(), 6);
    assert_eq!(&buf, b"Xbcdef");
    handle.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_only_handle_cannot_read() {
    let t = mount(CacheMode::Full);
    let mut handle = create(&t, "f").await.unwrap();
    let mut buf = [0u8; 1];
    assert!(matches!(
        handle.read(&mut buf).await,
        Err(VfsError::PermissionDenied)
    ));
    handle.close().await.unwrap();

    let mut reader = t.open_file("f", OpenFlags::RDONLY, 0).await.unwrap();
    assert!(matches!(
        reader.write(b"x").await,
        Err(VfsError::PermissionDenied)
    ));
    reader.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_always_writes_at_the_end() {
    let t = mount(CacheMode::Writes);
    write_file(&t, "log", b"one\n").await.unwrap();
    let mut handle = t
        .open_file("log", OpenFlags::WRONLY | OpenFlags::APPEND, 0)
        .await
        .unwrap();
    handle.write_at(b"two\n", 0).await.unwrap();
    handle.write(b"three\n").await.unwrap();
    handle.close().await.unwrap();
    assert_eq!(read_file(&t, "log").await.unwrap(), b"one\ntwo\nthree\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_through_a_handle() {
    let t = mount(CacheMode::Writes);
    write_file(&t, "f", b"0123456789").await.unwrap();
    let mut handle = t.open_file("f", OpenFlags::RDWR, 0).await.unwrap();
    handle.truncate(3).await.unwrap();
    assert_eq!(t.stat("f").await.unwrap().attr().size, 10);
    assert_eq!(handle.seek(SeekFrom::End(0)).unwrap(), 3);
    handle.write(b"!").await.unwrap();
    handle.close().await.unwrap();
    assert_eq!(read_file(&t, "f").await.unwrap(), b"012!");
    assert_eq!(t.stat("f").await.unwrap().attr().size, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_see_unsaved_changes_of_open_writers() {
    let t = mount(CacheMode::Minimal);
    write_file(&t, "f", b"before").await.unwrap();
    let mut writer = t.open_file("f", OpenFlags::WRONLY, 0).await.unwrap();
    writer.write_at(b"AFTER!", 0).await.unwrap();

    let mut reader = t.open_file("f", OpenFlags::RDONLY, 0).await.unwrap();
    assert_eq!(read_to_end(&mut reader).await.unwrap(), b"AFTER!");
    reader.close().await.unwrap();

    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"before");
    writer.close().await.unwrap();
    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"AFTER!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_upload_keeps_the_staged_copy() {
    let t = mount(CacheMode::Writes);
    t.backend.fail_next(FailPoint::Put, 1);
    let mut handle = create(&t, "f").await.unwrap();
    handle.write(b"precious").await.unwrap();
    assert!(matches!(
        handle.close().await,
        Err(VfsError::BackendTransient(_))
    ));
    assert!(t.backend.contents("f").is_none());
    assert!(t.cache().staging().contains(t.stat("f").await.unwrap().inode()));

    // The next writer to close uploads the kept changes.
    let mut retry = t.open_file("f", OpenFlags::WRONLY, 0).await.unwrap();
    retry.close().await.unwrap();
    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"precious");
    assert!(t.cache().staging().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_file_is_downloaded_once_per_open() {
    let backend = MemoryBackend::new();
    backend.external_put("f", "0123456789", SystemTime::now());
    let t = mount_with(backend, CacheMode::Minimal, |_| {});

    let mut handle = t.open_file("f", OpenFlags::WRONLY, 0).await.unwrap();
    assert_eq!(t.backend.gets(), 0, "the copy is filled lazily");
    handle.write_at(b"AB", 2).await.unwrap();
    handle.write_at(b"CD", 6).await.unwrap();
    handle.close().await.unwrap();

    assert_eq!(t.backend.gets(), 1);
    assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"01AB45CD89");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncating_open_skips_the_download() {
    let backend = MemoryBackend::new();
    backend.external_put("f", "old content", SystemTime::now());
    let t = mount_with(backend, CacheMode::Full, |_| {});

    let mut handle = create(&t, "f").await.unwrap();
    handle.write(b"new").await.unwrap();
    handle.close().await.unwrap();

    assert_eq!(t.backend.gets(), 0);
    assert_eq!(read_file(&t, "f").await.unwrap(), b"new");
    assert_eq!(t.backend.gets(), 0, "served from the retained copy");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_at_leaves_the_offset_alone() {
    for mode in [CacheMode::Minimal, CacheMode::Writes, CacheMode::Full] {
        let t = mount(mode);
        let mut handle = t.open_file("f", rw_create(), 0o644).await.unwrap();

        assert_eq!(handle.write_at(b"hello**", 0).await.unwrap(), 7);
        assert_eq!(handle.seek(SeekFrom::Current(0)).unwrap(), 0, "mode {mode}");
        handle.write(b"X").await.unwrap();
        assert_eq!(handle.seek(SeekFrom::Current(0)).unwrap(), 1, "mode {mode}");
        handle.close().await.unwrap();

        assert_eq!(t.backend.contents("f").unwrap().as_ref(), b"Xello**", "mode {mode}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_past_the_end_fills_the_gap_with_zeros() {
    for mode in [CacheMode::Minimal, CacheMode::Writes, CacheMode::Full] {
        let t = mount(mode);
        let mut handle = t.open_file("f", rw_create(), 0o644).await.unwrap();

        handle.write_at(b"ab", 0).await.unwrap();
        handle.write_at(b"xy", 6).await.unwrap();
        assert_eq!(handle.seek(SeekFrom::End(0)).unwrap(), 8, "mode {mode}");
        handle.close().await.unwrap();

        assert_eq!(
            t.backend.contents("f").unwrap().as_ref(),
            b"ab\0\0\0\0xy",
            "mode {mode}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_without_writes_uploads_nothing() {
    for mode in [CacheMode::Minimal, CacheMode::Writes, CacheMode::Full] {
        let t = mount(mode);
        let mut handle = create(&t, "new").await.unwrap();
        handle.flush().await.unwrap();
        handle.flush().await.unwrap();
        assert_eq!(t.backend.puts(), 0, "mode {mode}");
        // Closing still creates the empty file.
        handle.close().await.unwrap();
        assert_eq!(t.backend.puts(), 1, "mode {mode}");
        assert!(t.backend.contents("new").unwrap().is_empty());

        write_file(&t, "old", b"abc").await.unwrap();
        let mut handle = t.open_file("old", OpenFlags::RDWR, 0).await.unwrap();
        handle.flush().await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(t.backend.puts(), 2, "mode {mode}");
        assert_eq!(t.backend.contents("old").unwrap().as_ref(), b"abc");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flushing_does_not_allow_mixing_in_minimal_mode() {
    let t = mount(CacheMode::Minimal);
    write_file(&t, "f", b"abcdef").await.unwrap();
    let mut handle = t.open_file("f", OpenFlags::RDWR, 0).await.unwrap();
    handle.write_at(b"X", 0).await.unwrap();
    handle.flush().await.unwrap();

    let mut buf = [0u8; 6];
    assert!(matches!(
        handle.read_at(&mut buf, 0).await,
        Err(VfsError::PermissionDenied)
    ));
    handle.close().await.unwrap();
    assert_eq!(read_file(&t, "f").await.unwrap(), b"Xbcdef");
}
