//! The remote storage capability interface consumed by the VFS.
//!
//! A [`Backend`] only has to offer whole-object semantics: list a directory, fetch an object's
//! metadata, stream a byte range, and replace an object wholesale from a stream. Everything else
//! (server-side move/copy, usage reporting, change notification, ...) is an optional capability
//! that a backend advertises by returning `Some` from the matching query method. Callers check for
//! a capability once and then call it directly, falling back to a degraded strategy when absent.

/// Local-directory backend.
pub mod local;
/// In-memory backend.
pub mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// A boxed byte stream, used both for object downloads and uploads.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Errors reported by a backend driver.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The named object or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The directory still has entries.
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),

    /// The backend does not implement the requested operation.
    #[error("operation not supported by backend")]
    Unsupported,

    /// A retryable failure such as a timeout or an unavailable service.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// A non-retryable failure such as an exhausted quota or rejected credentials.
    #[error("permanent backend failure: {0}")]
    Permanent(String),

    /// The transfer was abandoned before completion. Nothing was stored.
    #[error("transfer aborted")]
    Aborted,

    /// Local I/O failed while feeding or draining a stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata describing a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Slash separated path relative to the backend root.
    pub path: String,
    /// Size in bytes. `None` when the backend cannot know the size ahead of reading.
    pub size: Option<u64>,
    /// Last modification time.
    pub mod_time: SystemTime,
    /// Content hash, if the backend computes one.
    pub hash: Option<String>,
}

/// Metadata describing a remote directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    /// Slash separated path relative to the backend root.
    pub path: String,
    /// Last modification time, or the listing time for stores without one.
    pub mod_time: SystemTime,
}

/// A single entry produced by [`Backend::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A stored object.
    Object(ObjectInfo),
    /// A directory or common prefix.
    Dir(DirInfo),
}

impl Entry {
    /// The slash separated path of this entry.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Object(o) => &o.path,
            Self::Dir(d) => &d.path,
        }
    }

    /// The last path segment of this entry.
    #[must_use]
    pub fn leaf(&self) -> &str {
        leaf_name(self.path())
    }
}

/// Which part of an object to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadRange {
    /// First byte to return.
    pub offset: u64,
    /// Number of bytes to return, or `None` to read to the end.
    pub len: Option<u64>,
}

impl ReadRange {
    /// A range starting at `offset` and running to the end of the object.
    #[must_use]
    pub fn from(offset: u64) -> Self {
        Self { offset, len: None }
    }
}

/// Metadata accompanying an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutMeta {
    /// Length of the stream, if known ahead of time.
    pub size: Option<u64>,
    /// Modification time to record on the object.
    pub mod_time: SystemTime,
}

/// Storage usage as reported by [`About::about`]. `None` marks quantities the store cannot report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Total capacity in bytes.
    pub total: Option<u64>,
    /// Bytes in use.
    pub used: Option<u64>,
    /// Bytes available.
    pub free: Option<u64>,
}

/// A change observed on the remote side, independent of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The path that changed.
    pub path: String,
    /// Whether the change concerns a directory.
    pub is_dir: bool,
}

/// The mandatory operations every remote store provides.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Human readable name of this backend, used in logs.
    fn name(&self) -> &'static str;

    /// List the immediate children of `dir`. The root is the empty string.
    async fn list(&self, dir: &str) -> Result<Vec<Entry>, BackendError>;

    /// Fetch the metadata of the object at `path`.
    async fn new_object(&self, path: &str) -> Result<ObjectInfo, BackendError>;

    /// Open a read stream over `range` of `object`.
    async fn open(&self, object: &ObjectInfo, range: ReadRange)
    -> Result<ByteStream, BackendError>;

    /// Replace the object at `path` with the contents of `data`.
    ///
    /// Implementations must be atomic: if the returned future is dropped or the stream fails,
    /// the previous object (or its absence) must remain visible.
    async fn put(
        &self,
        path: &str,
        data: ByteStream,
        meta: PutMeta,
    ) -> Result<ObjectInfo, BackendError>;

    /// Delete the object at `path`.
    async fn remove(&self, path: &str) -> Result<(), BackendError>;

    /// Create the directory `dir`. Succeeds if it already exists.
    async fn mkdir(&self, dir: &str) -> Result<(), BackendError>;

    /// Remove the empty directory `dir`.
    async fn rmdir(&self, dir: &str) -> Result<(), BackendError>;

    /// Server-side move of a single object.
    fn mover(&self) -> Option<&dyn Mover> {
        None
    }

    /// Server-side copy of a single object.
    fn copier(&self) -> Option<&dyn Copier> {
        None
    }

    /// Server-side move of a whole directory tree.
    fn dir_mover(&self) -> Option<&dyn DirMover> {
        None
    }

    /// Storage usage reporting.
    fn about(&self) -> Option<&dyn About> {
        None
    }

    /// Updating an object's modification time in place.
    fn mod_time_setter(&self) -> Option<&dyn ModTimeSetter> {
        None
    }

    /// Notifications about changes made by other clients.
    fn change_notifier(&self) -> Option<&dyn ChangeNotifier> {
        None
    }

    /// Shareable public links.
    fn public_linker(&self) -> Option<&dyn PublicLinker> {
        None
    }

    /// Storage class / tier management.
    fn tiering(&self) -> Option<&dyn Tiering> {
        None
    }
}

/// Server-side single object move.
#[async_trait]
pub trait Mover: Send + Sync {
    /// Move `src` to `dst`, replacing anything already at `dst`.
    async fn move_object(&self, src: &ObjectInfo, dst: &str) -> Result<ObjectInfo, BackendError>;
}

/// Server-side single object copy.
#[async_trait]
pub trait Copier: Send + Sync {
    /// Copy `src` to `dst`, replacing anything already at `dst`.
    async fn copy_object(&self, src: &ObjectInfo, dst: &str) -> Result<ObjectInfo, BackendError>;
}

/// Server-side directory move.
#[async_trait]
pub trait DirMover: Send + Sync {
    /// Move the directory tree at `src` to `dst`. `dst` must not exist.
    async fn move_dir(&self, src: &str, dst: &str) -> Result<(), BackendError>;
}

/// Storage usage reporting.
#[async_trait]
pub trait About: Send + Sync {
    /// Query current usage.
    async fn about(&self) -> Result<Usage, BackendError>;
}

/// In-place modification time updates.
#[async_trait]
pub trait ModTimeSetter: Send + Sync {
    /// Set the modification time of the object at `path`.
    async fn set_mod_time(&self, path: &str, mod_time: SystemTime)
    -> Result<ObjectInfo, BackendError>;
}

/// Change notification feed.
pub trait ChangeNotifier: Send + Sync {
    /// Subscribe to remote changes. Each call returns an independent receiver.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent>;
}

/// Public link generation.
#[async_trait]
pub trait PublicLinker: Send + Sync {
    /// Produce a link through which `path` can be fetched without credentials.
    async fn public_link(&self, path: &str) -> Result<String, BackendError>;
}

/// Storage tier management.
#[async_trait]
pub trait Tiering: Send + Sync {
    /// Current tier of the object at `path`.
    async fn tier(&self, path: &str) -> Result<String, BackendError>;

    /// Move the object at `path` to `tier`.
    async fn set_tier(&self, path: &str, tier: &str) -> Result<(), BackendError>;
}

/// Which optional capabilities a backend offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "a flat capability table is the point of this type"
)]
pub struct Features {
    /// [`Backend::mover`] is available.
    pub server_move: bool,
    /// [`Backend::copier`] is available.
    pub server_copy: bool,
    /// [`Backend::dir_mover`] is available.
    pub dir_move: bool,
    /// [`Backend::about`] is available.
    pub about: bool,
    /// [`Backend::mod_time_setter`] is available.
    pub set_mod_time: bool,
    /// [`Backend::change_notifier`] is available.
    pub change_notify: bool,
    /// [`Backend::public_linker`] is available.
    pub public_link: bool,
    /// [`Backend::tiering`] is available.
    pub tiering: bool,
}

impl Features {
    /// Ask `backend` for each optional capability.
    #[must_use]
    pub fn detect(backend: &dyn Backend) -> Self {
        Self {
            server_move: backend.mover().is_some(),
            server_copy: backend.copier().is_some(),
            dir_move: backend.dir_mover().is_some(),
            about: backend.about().is_some(),
            set_mod_time: backend.mod_time_setter().is_some(),
            change_notify: backend.change_notifier().is_some(),
            public_link: backend.public_linker().is_some(),
            tiering: backend.tiering().is_some(),
        }
    }
}

/// Join a directory path and a leaf name with a single slash.
#[must_use]
pub fn join_path(dir: &str, leaf: &str) -> String {
    if dir.is_empty() {
        leaf.to_owned()
    } else if leaf.is_empty() {
        dir.to_owned()
    } else {
        format!("{dir}/{leaf}")
    }
}

/// The last segment of a slash separated path.
#[must_use]
pub fn leaf_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, leaf)| leaf)
}

/// The directory part of a slash separated path, empty for top level entries.
#[must_use]
pub fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_root() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a", "b"), "a/b");
        assert_eq!(join_path("a/b", ""), "a/b");
    }

    #[test]
    fn split_helpers_agree_with_join() {
        assert_eq!(leaf_name("dir/sub/file"), "file");
        assert_eq!(parent_path("dir/sub/file"), "dir/sub");
        assert_eq!(leaf_name("file"), "file");
        assert_eq!(parent_path("file"), "");
    }
}
