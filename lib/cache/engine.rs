use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::CacheMode;
use super::eviction::lru::{Deleter, LruEvictionTracker, Versioned};
use super::staging::{Acquired, Released, StagedEntry, StagingArea};
use crate::fs::{Inode, VfsError, VfsOptions};

/// Which incarnation of a retained copy an LRU slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyVersion(u64);

impl Versioned for CopyVersion {
    fn version(&self) -> u64 {
        self.0
    }
}

#[derive(Clone)]
struct StagingDeleter(Weak<StagingArea>);

impl Deleter<Inode, CopyVersion> for StagingDeleter {
    fn delete(&mut self, key: Inode, ctx: CopyVersion) -> impl Future<Output = ()> + Send {
        let staging = self.0.upgrade();
        async move {
            if let Some(staging) = staging {
                staging.evict(key, Some(ctx.0)).await;
            }
        }
    }
}

/// The mode switch plus the staging area and its full-mode eviction policy.
pub struct CacheEngine {
    mode: AtomicU8,
    staging: Arc<StagingArea>,
    lru: LruEvictionTracker<Inode, CopyVersion>,
    max_size: Option<u64>,
    max_age: Option<Duration>,
}

impl CacheEngine {
    const LRU_CHANNEL_SIZE: usize = 256;

    /// Build the engine described by `options`. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(options: &VfsOptions) -> Self {
        let staging = Arc::new(StagingArea::new(options.cache_dir.clone()));
        let lru = LruEvictionTracker::spawn(
            StagingDeleter(Arc::downgrade(&staging)),
            Self::LRU_CHANNEL_SIZE,
        );
        Self {
            mode: AtomicU8::new(options.cache_mode.to_bits()),
            staging,
            lru,
            max_size: options.cache_max_size,
            max_age: options.cache_max_age,
        }
    }

    /// The current mode.
    #[must_use]
    pub fn mode(&self) -> CacheMode {
        CacheMode::from_bits(self.mode.load(Ordering::Acquire))
    }

    /// Change the mode. Callers drain writers first.
    pub fn set_mode(&self, mode: CacheMode) {
        let old = CacheMode::from_bits(self.mode.swap(mode.to_bits(), Ordering::AcqRel));
        if old != mode {
            info!(%old, new = %mode, "cache mode changed");
        }
    }

    /// The staging area.
    #[must_use]
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Take a reference on the staged copy for `inode`, creating it if needed.
    pub async fn acquire(&self, inode: Inode) -> Result<Acquired, VfsError> {
        let acquired = self.staging.acquire(inode).await?;
        self.lru.access(inode);
        Ok(acquired)
    }

    /// Take a reference on the staged copy for `inode` only if another handle is using it or it
    /// holds changes not yet uploaded.
    pub async fn acquire_live(&self, inode: Inode) -> Option<Arc<StagedEntry>> {
        let entry = self.staging.acquire_live(inode).await?;
        self.lru.access(inode);
        Some(entry)
    }

    /// Drop a handle's reference on `entry`. In full mode the idle copy is kept and becomes an
    /// eviction candidate.
    pub fn release(&self, entry: &StagedEntry) {
        let inode = entry.inode();
        match self.staging.release(inode, self.mode() == CacheMode::Full) {
            Released::Retained { version } => {
                self.staging
                    .tracker()
                    .track(inode, entry.staged_len().unwrap_or(0));
                self.lru.upsert(inode, CopyVersion(version));
            }
            Released::Pinned => debug!(inode, "keeping staged copy with unsaved changes"),
            Released::InUse | Released::Removed | Released::Unknown => {}
        }
    }

    /// Mark whether the staged copy of `inode` holds changes the backend has not accepted.
    pub fn set_pinned(&self, inode: Inode, pinned: bool) {
        self.staging.set_pinned(inode, pinned);
    }

    /// Throw away the staged copy of a removed file, if nobody holds it.
    pub async fn forget(&self, inode: Inode) {
        self.staging.discard(inode).await;
    }

    /// Delete every idle copy that holds no unsaved changes.
    pub async fn purge(&self) -> usize {
        let removed = self.staging.purge().await;
        debug!(removed, "purged idle staged copies");
        removed
    }

    /// Delete every idle copy and wipe the staging directory.
    pub async fn clean_up(&self) -> Result<(), VfsError> {
        self.staging.clean_up().await?;
        Ok(())
    }

    /// Apply the age and size limits to idle copies. Called periodically by the cleaner.
    #[instrument(name = "CacheEngine::enforce_limits", skip(self))]
    pub async fn enforce_limits(&self) {
        if let Some(max_age) = self.max_age {
            for inode in self.staging.tracker().stale_entries(max_age).await {
                self.staging.evict(inode, None).await;
            }
        }

        let Some(max_size) = self.max_size else {
            return;
        };
        loop {
            let before = self.staging.tracker().estimated_size();
            if before <= max_size {
                return;
            }
            if !self.lru.try_cull(1) {
                tokio::task::yield_now().await;
                continue;
            }
            while self.lru.have_pending_culls() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            if self.staging.tracker().estimated_size() >= before {
                // The coldest key was busy. Retry on the next poll.
                debug!(size = before, max_size, "staging area still over its size limit");
                return;
            }
        }
    }
}
