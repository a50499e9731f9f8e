#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::io::SeekFrom;
use std::time::{Duration, SystemTime};

use common::{ALL_MODES, mount, mount_with, names, read_file, read_to_end, write_file};
use remote_vfs::backend::MemoryBackend;
use remote_vfs::cache::CacheMode;
use remote_vfs::fs::{HandleState, NodeKind, OpenFlags, VfsError};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_close_reopen_read_in_every_mode() {
    for mode in ALL_MODES {
        let t = mount(mode);
        write_file(&t, "dir/file.txt", b"")
            .await
            .expect_err("parent does not exist yet");
        t.mkdir("dir").await.unwrap();
        write_file(&t, "dir/file.txt", b"some content").await.unwrap();

        assert_eq!(
            read_file(&t, "dir/file.txt").await.unwrap(),
            b"some content",
            "mode {mode}"
        );
        assert_eq!(
            t.backend.contents("dir/file.txt").unwrap().as_ref(),
            b"some content",
            "mode {mode}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_entries_are_visible_before_any_listing() {
    let t = mount(CacheMode::Writes);
    t.mkdir("a").await.unwrap();
    let handle = common::create(&t, "a/b").await.unwrap();

    assert!(t.stat("a").await.unwrap().is_dir());
    let file = t.stat("a/b").await.unwrap();
    assert_eq!(file.kind(), NodeKind::File);
    assert_eq!(names(&t, "a").await, vec!["b"]);

    // Nothing reached the backend yet apart from the directory.
    assert!(t.backend.object_paths().is_empty());
    drop(handle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_is_sorted_and_merges_backend_objects() {
    let backend = MemoryBackend::new();
    backend.external_put("zeta", "z", SystemTime::now());
    backend.external_put("alpha", "a", SystemTime::now());
    backend.external_put("sub/inner", "i", SystemTime::now());
    let t = mount_with(backend, CacheMode::Off, |_| {});

    write_file(&t, "mid", b"m").await.unwrap();
    assert_eq!(names(&t, "").await, vec!["alpha", "mid", "sub", "zeta"]);
    assert_eq!(names(&t, "sub").await, vec!["inner"]);
    assert_eq!(t.stat("alpha").await.unwrap().attr().size, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stat_errors() {
    let t = mount(CacheMode::Off);
    write_file(&t, "file", b"x").await.unwrap();

    assert!(matches!(t.stat("missing").await, Err(VfsError::NotExist)));
    assert!(matches!(t.stat("file/below").await, Err(VfsError::NotDir)));
    assert!(matches!(
        t.stat_parent("file/below").await,
        Err(VfsError::AlreadyExists)
    ));

    let (root, leaf) = t.stat_parent("/").await.unwrap();
    assert!(root.is_root());
    assert!(leaf.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_at_or_past_eof_return_nothing() {
    for hide_sizes in [false, true] {
        let backend = MemoryBackend::new();
        backend.external_put("sixteen", "0123456789abcdef", SystemTime::now());
        backend.set_hide_sizes(hide_sizes);
        let t = mount_with(backend, CacheMode::Off, |_| {});

        let mut handle = t.open_file("sixteen", OpenFlags::RDONLY, 0).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(handle.read_at(&mut buf, 16).await.unwrap(), 0);
        assert_eq!(handle.read_at(&mut buf, 100).await.unwrap(), 0);

        let all = read_to_end(&mut handle).await.unwrap();
        assert_eq!(all, b"0123456789abcdef");
        assert_eq!(handle.read(&mut buf).await.unwrap(), 0);
        handle.close().await.unwrap();

        // Reading to the end taught the node its size.
        assert_eq!(t.stat("sixteen").await.unwrap().attr().size, 16);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seek_past_eof_then_read_returns_nothing() {
    for mode in ALL_MODES {
        let t = mount(mode);
        write_file(&t, "f", b"0123456789abcdef").await.unwrap();

        let mut handle = t.open_file("f", OpenFlags::RDONLY, 0).await.unwrap();
        assert_eq!(handle.seek(SeekFrom::Start(100)).unwrap(), 100);
        let mut buf = [0u8; 4];
        assert_eq!(handle.read(&mut buf).await.unwrap(), 0, "mode {mode}");

        assert_eq!(handle.seek(SeekFrom::End(-4)).unwrap(), 12);
        assert_eq!(handle.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"cdef");
        assert!(matches!(
            handle.seek(SeekFrom::Current(-100)),
            Err(VfsError::InvalidArgument)
        ));
        handle.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn double_close_is_reported() {
    for mode in ALL_MODES {
        let t = mount(mode);
        let mut handle = common::create(&t, "f").await.unwrap();
        handle.write(b"abc").await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(
            matches!(handle.close().await, Err(VfsError::Closed)),
            "mode {mode}"
        );
        assert!(matches!(handle.write(b"x").await, Err(VfsError::Closed)));
    }

    let t = mount(CacheMode::Off);
    let mut dir = t.open_file("", OpenFlags::RDONLY, 0).await.unwrap();
    dir.close().await.unwrap();
    assert!(matches!(dir.close().await, Err(VfsError::Closed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_flag_rules() {
    let t = mount(CacheMode::Off);
    write_file(&t, "f", b"data").await.unwrap();

    let exclusive = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::EXCL;
    assert!(matches!(
        t.open_file("f", exclusive, 0o644).await,
        Err(VfsError::AlreadyExists)
    ));
    assert!(matches!(
        t.open_file("missing", OpenFlags::RDONLY, 0).await,
        Err(VfsError::NotExist)
    ));
    assert!(matches!(
        t.open_file("f", OpenFlags::from_bits_retain(libc::O_ACCMODE), 0)
            .await,
        Err(VfsError::PermissionDenied)
    ));
    assert!(matches!(
        t.open_file("", OpenFlags::WRONLY, 0).await,
        Err(VfsError::IsDir)
    ));

    // Without a local copy an existing object can only be replaced, not updated.
    assert!(matches!(
        t.open_file("f", OpenFlags::WRONLY, 0).await,
        Err(VfsError::PermissionDenied)
    ));
    let mut rw = t.open_file("f", OpenFlags::RDWR, 0).await.unwrap();
    assert!(matches!(rw.write(b"x").await, Err(VfsError::PermissionDenied)));
    assert_eq!(read_to_end(&mut rw).await.unwrap(), b"data");
    rw.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_rejects_mutations() {
    let backend = MemoryBackend::new();
    backend.external_put("f", "data", SystemTime::now());
    let t = mount_with(backend, CacheMode::Full, |o| o.read_only = true);

    assert_eq!(read_file(&t, "f").await.unwrap(), b"data");
    assert!(matches!(
        t.open_file("f", OpenFlags::RDWR, 0).await,
        Err(VfsError::ReadOnly)
    ));
    assert!(matches!(t.mkdir("d").await, Err(VfsError::ReadOnly)));
    assert!(matches!(t.remove("f").await, Err(VfsError::ReadOnly)));
    assert!(matches!(t.rename("f", "g").await, Err(VfsError::ReadOnly)));
    assert!(matches!(
        t.set_mod_time("f", SystemTime::UNIX_EPOCH).await,
        Err(VfsError::ReadOnly)
    ));
    assert!(matches!(t.truncate("f", 0).await, Err(VfsError::ReadOnly)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_files_and_directories() {
    let t = mount(CacheMode::Minimal);
    t.mkdir("d").await.unwrap();
    write_file(&t, "d/f", b"x").await.unwrap();

    assert!(matches!(t.remove("d").await, Err(VfsError::NotEmpty)));
    assert!(matches!(t.remove("").await, Err(VfsError::InvalidArgument)));
    t.remove("d/f").await.unwrap();
    assert!(matches!(t.stat("d/f").await, Err(VfsError::NotExist)));
    assert!(t.backend.contents("d/f").is_none());

    t.remove("d").await.unwrap();
    assert!(names(&t, "").await.is_empty());
    assert!(matches!(t.mkdir("d/e").await, Err(VfsError::NotExist)));
    t.mkdir("d").await.unwrap();
    assert!(matches!(t.mkdir("d").await, Err(VfsError::AlreadyExists)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_listing_entry_stays_hidden_until_backend_agrees() {
    let backend = MemoryBackend::new();
    backend.external_put("f", "x", SystemTime::now());
    let t = mount_with(backend, CacheMode::Off, |o| {
        o.dir_cache_time = Duration::ZERO;
    });

    assert_eq!(names(&t, "").await, vec!["f"]);
    t.remove("f").await.unwrap();
    // Every access relists; the entry must not reappear.
    assert!(names(&t, "").await.is_empty());
    assert!(matches!(t.stat("f").await, Err(VfsError::NotExist)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_by_path() {
    for mode in [CacheMode::Minimal, CacheMode::Full] {
        let t = mount(mode);
        write_file(&t, "f", b"0123456789").await.unwrap();

        t.truncate("f", 4).await.unwrap();
        assert_eq!(read_file(&t, "f").await.unwrap(), b"0123", "mode {mode}");

        t.truncate("f", 0).await.unwrap();
        assert_eq!(t.backend.contents("f").unwrap().len(), 0);
    }

    // Without staging only truncation to zero is possible.
    let t = mount(CacheMode::Off);
    write_file(&t, "f", b"0123456789").await.unwrap();
    t.truncate("f", 0).await.unwrap();
    assert_eq!(t.backend.contents("f").unwrap().len(), 0);
    assert!(t.truncate("", 0).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_idempotent_and_cleans_staging() {
    let t = mount(CacheMode::Full);
    write_file(&t, "f", b"cached").await.unwrap();
    assert_eq!(t.cache().staging().len(), 1);

    t.shutdown().await.unwrap();
    assert!(t.cache().staging().is_empty());
    t.shutdown().await.unwrap();
}
