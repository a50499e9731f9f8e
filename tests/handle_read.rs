#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::io::SeekFrom;
use std::time::SystemTime;

use common::{mount_with, read_to_end};
use remote_vfs::backend::MemoryBackend;
use remote_vfs::cache::CacheMode;
use remote_vfs::fs::OpenFlags;

const DATA: &[u8] = b"0123456789abcdef";

fn backend_with_data() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.external_put("f", DATA, SystemTime::now());
    backend
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_stream_is_reopened_at_the_requested_offset() {
    let t = mount_with(backend_with_data(), CacheMode::Off, |_| {});
    let mut handle = t.open_file("f", OpenFlags::RDONLY, 0).await.unwrap();
    t.backend.sever_next_stream(4);

    let mut buf = [0u8; 16];
    assert!(handle.read_at(&mut buf, 0).await.is_err());
    assert_eq!(handle.read_at(&mut buf, 0).await.unwrap(), 16);
    assert_eq!(&buf, DATA);
    assert_eq!(t.backend.gets(), 2);
    handle.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_reads_share_one_stream() {
    let t = mount_with(backend_with_data(), CacheMode::Off, |_| {});
    let mut handle = t.open_file("f", OpenFlags::RDONLY, 0).await.unwrap();

    let mut buf = [0u8; 4];
    for chunk in DATA.chunks(4) {
        assert_eq!(handle.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, chunk);
    }
    assert_eq!(handle.read(&mut buf).await.unwrap(), 0);
    assert_eq!(t.backend.gets(), 1);

    // A seek breaks the sequence and opens a new stream at the target.
    handle.seek(SeekFrom::Start(10)).unwrap();
    assert_eq!(read_to_end(&mut handle).await.unwrap(), b"abcdef");
    assert_eq!(t.backend.gets(), 2);
    handle.close().await.unwrap();
}
