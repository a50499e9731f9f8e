#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::time::{Duration, SystemTime};

use common::{create, mount, mount_with, write_file};
use remote_vfs::backend::memory::Capabilities;
use remote_vfs::backend::{Backend as _, MemoryBackend};
use remote_vfs::cache::CacheMode;
use remote_vfs::fs::VfsError;

fn an_hour_ago() -> SystemTime {
    SystemTime::now() - Duration::from_secs(3600)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mod_time_is_stored_on_the_backend() {
    let t = mount(CacheMode::Off);
    write_file(&t, "f", b"x").await.unwrap();
    let when = an_hour_ago();

    t.set_mod_time("f", when).await.unwrap();
    assert_eq!(t.stat("f").await.unwrap().attr().mod_time, when);
    assert_eq!(t.backend.new_object("f").await.unwrap().mod_time, when);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mod_time_waits_for_open_writers() {
    for mode in [CacheMode::Off, CacheMode::Writes] {
        let t = mount(mode);
        let mut handle = create(&t, "f").await.unwrap();
        handle.write(b"still writing").await.unwrap();
        let when = an_hour_ago();

        t.set_mod_time("f", when).await.unwrap();
        assert_eq!(
            t.stat("f").await.unwrap().attr().mod_time,
            when,
            "mode {mode}: pending time is reported right away"
        );
        assert!(t.backend.contents("f").is_none());

        handle.close().await.unwrap();
        assert_eq!(t.stat("f").await.unwrap().attr().mod_time, when);
        assert_eq!(
            t.backend.new_object("f").await.unwrap().mod_time,
            when,
            "mode {mode}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mod_time_is_kept_locally_without_backend_support() {
    let backend = MemoryBackend::new();
    backend.set_capabilities(Capabilities::SET_MOD_TIME, false);
    let t = mount_with(backend, CacheMode::Minimal, |_| {});
    write_file(&t, "f", b"x").await.unwrap();
    let stored = t.backend.new_object("f").await.unwrap().mod_time;
    let when = an_hour_ago();

    t.set_mod_time("f", when).await.unwrap();
    assert_eq!(t.stat("f").await.unwrap().attr().mod_time, when);
    assert_eq!(t.backend.new_object("f").await.unwrap().mod_time, stored);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mod_time_on_a_directory_is_ignored() {
    let t = mount(CacheMode::Off);
    t.mkdir("d").await.unwrap();
    t.set_mod_time("d", SystemTime::UNIX_EPOCH).await.unwrap();
    assert!(matches!(
        t.set_mod_time("missing", SystemTime::UNIX_EPOCH).await,
        Err(VfsError::NotExist)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attributes_follow_configured_permissions() {
    let t = mount_with(MemoryBackend::new(), CacheMode::Off, |o| {
        o.file_perms = 0o666;
        o.dir_perms = 0o777;
        o.umask = 0o027;
        o.uid = 1234;
        o.gid = 5678;
    });
    write_file(&t, "f", b"abc").await.unwrap();
    t.mkdir("d").await.unwrap();

    let file = t.stat("f").await.unwrap().attr();
    assert_eq!(file.perms.bits(), 0o640);
    assert_eq!((file.uid, file.gid), (1234, 5678));
    assert_eq!(file.size, 3);
    assert_eq!(t.stat("d").await.unwrap().attr().perms.bits(), 0o750);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tiers_and_public_links() {
    let t = mount(CacheMode::Off);
    write_file(&t, "f", b"x").await.unwrap();
    t.mkdir("d").await.unwrap();

    assert_eq!(t.tier("f").await.unwrap(), "standard");
    t.set_tier("f", "archive").await.unwrap();
    assert_eq!(t.tier("f").await.unwrap(), "archive");
    assert!(matches!(t.tier("d").await, Err(VfsError::IsDir)));

    assert_eq!(t.public_link("f").await.unwrap(), "memory:///f");
    assert!(matches!(
        t.public_link("missing").await,
        Err(VfsError::NotExist)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn optional_features_follow_the_backend() {
    let backend = MemoryBackend::new();
    backend.set_capabilities(Capabilities::TIERING | Capabilities::PUBLIC_LINK, false);
    let t = mount_with(backend, CacheMode::Off, |_| {});
    write_file(&t, "f", b"x").await.unwrap();

    let features = t.features();
    assert!(!features.tiering);
    assert!(!features.public_link);
    assert!(features.server_move);
    assert!(matches!(t.tier("f").await, Err(VfsError::Unsupported)));
    assert!(matches!(
        t.public_link("f").await,
        Err(VfsError::Unsupported)
    ));
}
