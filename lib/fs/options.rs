use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheMode;

/// Options supplied when constructing a [`Vfs`](super::Vfs).
///
/// Everything except the cache mode is fixed for the lifetime of the instance. The cache mode can
/// be changed later through [`Vfs::set_cache_mode`](super::Vfs::set_cache_mode).
#[derive(Debug, Clone)]
pub struct VfsOptions {
    /// How file content is buffered locally.
    pub cache_mode: CacheMode,
    /// How long a directory listing is trusted before it is refreshed.
    pub dir_cache_time: Duration,
    /// Permission template for directories, before the umask is applied.
    pub dir_perms: u32,
    /// Permission template for files, before the umask is applied.
    pub file_perms: u32,
    /// Bits cleared from both permission templates.
    pub umask: u16,
    /// Reject every mutating operation with [`VfsError::ReadOnly`](super::VfsError::ReadOnly).
    pub read_only: bool,
    /// Owner reported for every node.
    pub uid: u32,
    /// Group reported for every node.
    pub gid: u32,
    /// Directory holding staged copies. Created on first use.
    pub cache_dir: PathBuf,
    /// Upper bound for the total size of idle staged copies in full mode.
    pub cache_max_size: Option<u64>,
    /// Idle staged copies older than this are evicted in full mode.
    pub cache_max_age: Option<Duration>,
    /// How often the full-mode cleaner checks the limits above.
    pub cache_poll_interval: Duration,
    /// How long a [`Vfs::statfs`](super::Vfs::statfs) answer is reused.
    pub usage_cache_time: Duration,
    /// How long a cache-mode switch or shutdown waits for open writers.
    pub write_wait: Duration,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Off,
            dir_cache_time: Duration::from_secs(300),
            dir_perms: 0o777,
            file_perms: 0o666,
            umask: 0o022,
            read_only: false,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            cache_dir: std::env::temp_dir().join("remote-vfs-cache"),
            cache_max_size: None,
            cache_max_age: Some(Duration::from_secs(3600)),
            cache_poll_interval: Duration::from_secs(60),
            usage_cache_time: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
        }
    }
}
