//! Per-directory listing cache.
//!
//! Each [`Dir`](super::Dir) owns one [`DirCache`]: the children it knows about, markers for local
//! changes a backend listing has not confirmed yet, and a refresh gate so only one caller lists
//! the backend at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use super::Node;

/// A local change not yet reflected in a backend listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Virtual {
    /// Created or moved here locally. Survives listings that do not show it yet.
    Added,
    /// Removed or moved away locally. Hidden even if a listing still shows it.
    Removed,
}

/// The cached view of one directory.
#[derive(Debug, Default)]
pub struct Listing {
    /// Known children by name.
    pub items: BTreeMap<String, Node>,
    /// Unconfirmed local changes by name.
    pub virtuals: FxHashMap<String, Virtual>,
    /// When the last backend listing was merged. `None` until the first one, and after a flush.
    pub read_time: Option<Instant>,
}

impl Listing {
    /// Insert `node` as a local creation.
    pub fn add_virtual(&mut self, name: String, node: Node) {
        self.virtuals.insert(name.clone(), Virtual::Added);
        self.items.insert(name, node);
    }

    /// Remove `name` as a local deletion, returning the node that was there.
    pub fn remove_virtual(&mut self, name: &str) -> Option<Node> {
        self.virtuals.insert(name.to_owned(), Virtual::Removed);
        self.items.remove(name)
    }

    /// Put back what [`Self::add_virtual`] or [`Self::remove_virtual`] replaced.
    pub fn restore(&mut self, name: &str, node: Option<Node>, marker: Option<Virtual>) {
        match node {
            Some(node) => {
                self.items.insert(name.to_owned(), node);
            }
            None => {
                self.items.remove(name);
            }
        }
        match marker {
            Some(marker) => {
                self.virtuals.insert(name.to_owned(), marker);
            }
            None => {
                self.virtuals.remove(name);
            }
        }
    }
}

const REFRESH_IDLE: u8 = 0;
const REFRESH_IN_PROGRESS: u8 = 1;

/// Result of asking to refresh a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    /// The listing is younger than the TTL.
    Fresh,
    /// This caller must list the backend. Carries the generation at claim time so
    /// [`DirCache::finish_refresh`] can tell whether an invalidation raced the listing.
    Claimed(u64),
    /// Another caller is listing right now.
    InProgress,
}

/// Listing cache with a single-flight refresh gate.
#[derive(Debug)]
pub struct DirCache {
    listing: RwLock<Listing>,
    refreshing: AtomicU8,
    /// Bumped by every invalidation.
    generation: AtomicU64,
    /// Wakes waiters when `refreshing` returns to idle.
    notify: Notify,
}

impl DirCache {
    /// An empty cache that must be listed before use.
    #[must_use]
    pub fn new() -> Self {
        Self::with_listing(Listing::default())
    }

    /// An empty cache that counts as freshly listed. Used for directories created locally.
    #[must_use]
    pub fn new_listed() -> Self {
        Self::with_listing(Listing {
            read_time: Some(Instant::now()),
            ..Listing::default()
        })
    }

    fn with_listing(listing: Listing) -> Self {
        Self {
            listing: RwLock::new(listing),
            refreshing: AtomicU8::new(REFRESH_IDLE),
            generation: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Shared access to the listing.
    pub fn read(&self) -> RwLockReadGuard<'_, Listing> {
        self.listing
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Exclusive access to the listing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Listing> {
        self.listing
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether a listing has ever been merged since the last invalidation.
    #[must_use]
    pub fn has_listing(&self) -> bool {
        self.read().read_time.is_some()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.read().read_time.is_some_and(|t| t.elapsed() < ttl)
    }

    /// Claim the refresh if the listing is older than `ttl`.
    pub fn try_claim_refresh(&self, ttl: Duration) -> RefreshStatus {
        if self.is_fresh(ttl) {
            return RefreshStatus::Fresh;
        }
        match self.refreshing.compare_exchange(
            REFRESH_IDLE,
            REFRESH_IN_PROGRESS,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => RefreshStatus::Claimed(self.generation.load(Ordering::Acquire)),
            Err(_) => RefreshStatus::InProgress,
        }
    }

    /// Apply a completed listing through `merge` and release the claim.
    ///
    /// If an invalidation happened since `claimed_gen`, the listing may predate the change it
    /// announced; it is dropped and `false` is returned so the caller lists again.
    pub fn finish_refresh(&self, claimed_gen: u64, merge: impl FnOnce(&mut Listing)) -> bool {
        let applied = {
            let mut listing = self.write();
            if self.generation.load(Ordering::Acquire) == claimed_gen {
                merge(&mut listing);
                listing.read_time = Some(Instant::now());
                true
            } else {
                false
            }
        };
        self.refreshing.store(REFRESH_IDLE, Ordering::Release);
        self.notify.notify_waiters();
        applied
    }

    /// Release the claim without touching the listing.
    pub fn abort_refresh(&self) {
        self.refreshing.store(REFRESH_IDLE, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Wait until no refresh is in progress.
    ///
    /// The `Notified` future is enabled before the flag is read, so a wakeup between the read and
    /// the first poll cannot be lost.
    pub async fn wait_refresh(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.refreshing.load(Ordering::Acquire) != REFRESH_IN_PROGRESS {
                return;
            }
            notified.await;
        }
    }

    /// Forget when the directory was listed, so the next access lists again.
    pub fn invalidate(&self) {
        let mut listing = self.write();
        listing.read_time = None;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets a claimed refresh if the listing future is dropped before it finishes.
pub struct RefreshGuard<'a> {
    cache: &'a DirCache,
    armed: bool,
}

impl<'a> RefreshGuard<'a> {
    /// Arm a guard for a refresh claimed on `cache`.
    #[must_use]
    pub fn new(cache: &'a DirCache) -> Self {
        Self { cache, armed: true }
    }

    /// Defuse after [`DirCache::finish_refresh`].
    pub fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abort_refresh();
        }
    }
}
