//! On-disk staging area.
//!
//! Every file that is buffered locally gets exactly one staged copy, shared by all handles open on
//! it. Copies are reference counted; when the last handle releases a copy it is either deleted,
//! retained for reuse (full mode), or pinned because it holds data the backend has not accepted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::{debug, warn};

use super::tracker::CacheTracker;
use crate::fs::Inode;

/// Problems with the configured staging directory.
#[derive(Debug, Error)]
pub enum StagingRootError {
    /// The path exists but is not a directory.
    #[error("staging path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The directory holds files this program did not create.
    #[error("staging path contains data not created by remote-vfs: {0}")]
    RootPathUnsafeCache(PathBuf),

    /// I/O failed while preparing the directory.
    #[error("io error while preparing staging path: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifies which remote object version a staged copy mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    /// Remote size.
    pub size: Option<u64>,
    /// Remote modification time.
    pub mod_time: SystemTime,
}

/// Fill state of a staged copy.
#[derive(Debug, Default)]
pub struct Fill {
    /// The local file holds the file's full content.
    pub materialized: bool,
    /// The remote object the content was downloaded from or last uploaded to.
    pub fingerprint: Option<Fingerprint>,
}

/// A local file backing one or more handles on the same inode.
#[derive(Debug)]
pub struct StagedEntry {
    inode: Inode,
    path: PathBuf,
    fill: Mutex<Fill>,
    /// Length of the local file, [`Self::UNKNOWN_LEN`] until it is first filled.
    len: AtomicU64,
}

impl StagedEntry {
    const UNKNOWN_LEN: u64 = u64::MAX;

    /// The inode this copy belongs to.
    #[must_use]
    pub fn inode(&self) -> Inode {
        self.inode
    }

    /// Location of the local file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the fill state. Held while the copy is being downloaded.
    pub async fn lock_fill(&self) -> MutexGuard<'_, Fill> {
        self.fill.lock().await
    }

    /// Length of the local file as last recorded by a handle, `None` before it was filled.
    #[must_use]
    pub fn staged_len(&self) -> Option<u64> {
        let len = self.len.load(Ordering::Acquire);
        (len != Self::UNKNOWN_LEN).then_some(len)
    }

    /// Record the local file's length after it was filled, written or truncated.
    pub fn set_staged_len(&self, len: u64) {
        self.len.store(len, Ordering::Release);
    }
}

struct Slot {
    entry: Arc<StagedEntry>,
    refs: usize,
    pinned: bool,
    version: u64,
}

/// The result of [`StagingArea::acquire`].
#[derive(Debug)]
pub struct Acquired {
    /// The shared copy.
    pub entry: Arc<StagedEntry>,
    /// Another handle already held this copy.
    pub shared: bool,
}

/// What happened to a copy on [`StagingArea::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Other handles still reference the copy.
    InUse,
    /// The copy is idle and kept for reuse under the given version.
    Retained {
        /// Bumped on every retain, so eviction can tell incarnations apart.
        version: u64,
    },
    /// The copy is idle but holds changes the backend has not accepted.
    Pinned,
    /// The copy was deleted.
    Removed,
    /// Nothing was staged for the inode.
    Unknown,
}

/// Directory of staged copies keyed by inode.
pub struct StagingArea {
    configured: PathBuf,
    root: OnceCell<PathBuf>,
    slots: scc::HashMap<Inode, Slot>,
    tracker: CacheTracker,
    file_generator: AtomicU64,
}

impl StagingArea {
    // Changing this makes existing staging directories look foreign and refuse to open.
    const MARKER_FILE: &'static str = ".remote-vfs-cache";

    /// Create a staging area rooted at `path`. Nothing touches the disk until the first copy.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            configured: path,
            root: OnceCell::new(),
            slots: scc::HashMap::new(),
            tracker: CacheTracker::new(),
            file_generator: AtomicU64::new(0),
        }
    }

    /// Size bookkeeping for retained copies.
    #[must_use]
    pub fn tracker(&self) -> &CacheTracker {
        &self.tracker
    }

    /// Number of copies currently known, in use or idle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no copies exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether a copy exists for `inode`.
    #[must_use]
    pub fn contains(&self, inode: Inode) -> bool {
        self.slots.contains_sync(&inode)
    }

    /// Validate the configured directory once and return it.
    ///
    /// The directory must be missing, empty, or marked as ours. Leftovers from a previous run are
    /// wiped.
    async fn root(&self) -> Result<&Path, StagingRootError> {
        self.root
            .get_or_try_init(|| prepare_root(&self.configured))
            .await
            .map(PathBuf::as_path)
    }

    /// Take a reference on the copy for `inode`, creating an empty placeholder if none exists.
    ///
    /// The placeholder is not materialized: callers fill it under [`StagedEntry::lock_fill`].
    pub async fn acquire(&self, inode: Inode) -> Result<Acquired, StagingRootError> {
        use scc::hash_map::Entry;

        let root = self.root().await?;
        match self.slots.entry_async(inode).await {
            Entry::Occupied(mut occ) => {
                let slot = occ.get_mut();
                slot.refs += 1;
                Ok(Acquired {
                    entry: Arc::clone(&slot.entry),
                    shared: slot.refs > 1,
                })
            }
            Entry::Vacant(vac) => {
                let seq = self.file_generator.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(StagedEntry {
                    inode,
                    path: root.join(format!("{inode}-{seq}")),
                    fill: Mutex::new(Fill::default()),
                    len: AtomicU64::new(StagedEntry::UNKNOWN_LEN),
                });
                vac.insert_entry(Slot {
                    entry: Arc::clone(&entry),
                    refs: 1,
                    pinned: false,
                    version: 0,
                });
                debug!(inode, "created staged copy");
                Ok(Acquired {
                    entry,
                    shared: false,
                })
            }
        }
    }

    /// Take a reference on the copy for `inode` only if one is open elsewhere or pinned.
    pub async fn acquire_live(&self, inode: Inode) -> Option<Arc<StagedEntry>> {
        use scc::hash_map::Entry;

        match self.slots.entry_async(inode).await {
            Entry::Occupied(mut occ) if occ.get().refs > 0 || occ.get().pinned => {
                let slot = occ.get_mut();
                slot.refs += 1;
                Some(Arc::clone(&slot.entry))
            }
            Entry::Occupied(_) | Entry::Vacant(_) => None,
        }
    }

    /// Mark whether the copy holds changes that must survive release.
    pub fn set_pinned(&self, inode: Inode, pinned: bool) {
        self.slots.update_sync(&inode, |_, slot| slot.pinned = pinned);
    }

    /// Drop one reference. When it was the last, the copy is retained if `retain` is set or it is
    /// pinned, and deleted otherwise.
    ///
    /// Synchronous so handles can release from `Drop`.
    pub fn release(&self, inode: Inode, retain: bool) -> Released {
        use scc::hash_map::Entry;

        let Entry::Occupied(mut occ) = self.slots.entry_sync(inode) else {
            return Released::Unknown;
        };
        let slot = occ.get_mut();
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return Released::InUse;
        }
        if slot.pinned {
            return Released::Pinned;
        }
        if retain {
            slot.version += 1;
            return Released::Retained {
                version: slot.version,
            };
        }
        // Untracked under the slot lock, before the inode can be staged again.
        self.tracker.untrack(inode);
        let (_, slot) = occ.remove_entry();
        drop_file(&slot.entry.path);
        debug!(inode, "removed staged copy");
        Released::Removed
    }

    /// Delete the idle copy for `inode`.
    ///
    /// When `version` is given, only that incarnation is deleted. Copies in use or pinned are left
    /// alone. Returns whether a copy was deleted.
    pub async fn evict(&self, inode: Inode, version: Option<u64>) -> bool {
        use scc::hash_map::Entry;

        let Entry::Occupied(occ) = self.slots.entry_async(inode).await else {
            return false;
        };
        let slot = occ.get();
        if slot.refs > 0 || slot.pinned || version.is_some_and(|v| v != slot.version) {
            return false;
        }
        self.tracker.untrack(inode);
        let (_, slot) = occ.remove_entry();
        drop_file(&slot.entry.path);
        debug!(inode, "evicted staged copy");
        true
    }

    /// Delete the copy for `inode` even if pinned, as long as no handle uses it.
    pub async fn discard(&self, inode: Inode) -> bool {
        self.set_pinned(inode, false);
        self.evict(inode, None).await
    }

    /// Delete every idle, unpinned copy. Returns how many were deleted.
    pub async fn purge(&self) -> usize {
        let mut inodes = Vec::new();
        self.slots
            .iter_async(|inode, _| {
                inodes.push(*inode);
                true
            })
            .await;

        let mut removed = 0;
        for inode in inodes {
            if self.evict(inode, None).await {
                removed += 1;
            }
        }
        removed
    }

    /// Delete every copy nobody uses, pinned or not, and wipe the directory when nothing remains.
    pub async fn clean_up(&self) -> Result<(), StagingRootError> {
        let mut inodes = Vec::new();
        self.slots
            .iter_async(|inode, slot| {
                if slot.pinned {
                    warn!(inode, "discarding staged copy with changes that were never uploaded");
                }
                inodes.push(*inode);
                true
            })
            .await;
        for inode in inodes {
            self.discard(inode).await;
        }

        if let Some(root) = self.root.get() {
            if self.slots.is_empty() {
                wipe(root).await?;
            } else {
                warn!(
                    in_use = self.slots.len(),
                    "staged copies still in use, leaving staging directory in place"
                );
            }
        }
        Ok(())
    }
}

fn drop_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to delete staged copy");
    }
}

/// Delete everything under `root` except the marker that identifies it as a staging directory.
async fn wipe(root: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == StagingArea::MARKER_FILE {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            Ok(()) | Err(_) => {}
        }
    }
    Ok(())
}

async fn prepare_root(configured: &Path) -> Result<PathBuf, StagingRootError> {
    let mut pbuf = match tokio::fs::canonicalize(configured).await {
        Ok(mut p) => {
            if !tokio::fs::metadata(&p).await?.is_dir() {
                return Err(StagingRootError::NotADirectory(p));
            }

            let mut entries = tokio::fs::read_dir(&p).await?;
            let is_empty = entries.next_entry().await?.is_none();

            p.push(StagingArea::MARKER_FILE);
            let marker_exists = tokio::fs::try_exists(&p).await?;
            p.pop();

            if !(is_empty || marker_exists) {
                return Err(StagingRootError::RootPathUnsafeCache(p));
            }

            wipe(&p).await?;
            p
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(configured).await?;
            tokio::fs::canonicalize(configured).await?
        }
        Err(e) => return Err(e.into()),
    };

    pbuf.push(StagingArea::MARKER_FILE);
    tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&pbuf)
        .await?;
    pbuf.pop();

    debug!(root = %pbuf.display(), "staging directory ready");
    Ok(pbuf)
}
