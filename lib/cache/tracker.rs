//! Concurrent size and staleness bookkeeping for idle staged copies.
//!
//! [`CacheTracker`] records which inodes have a retained staged copy, how large it was when it was
//! last released, and when that happened. Every method takes `&self`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use scc::HashMap as ConcurrentHashMap;

use crate::fs::Inode;

struct TrackedCopy {
    released_at: Instant,
    size: u64,
}

/// Tracks retained staged copies, their sizes, and when they went idle.
pub struct CacheTracker {
    entries: ConcurrentHashMap<Inode, TrackedCopy>,
    total_bytes: AtomicU64,
}

impl CacheTracker {
    /// Create a new, empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: ConcurrentHashMap::new(),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// Record a retained copy of `size` bytes, replacing any previous record for `inode`.
    pub fn track(&self, inode: Inode, size: u64) {
        use scc::hash_map::Entry;

        match self.entries.entry_sync(inode) {
            Entry::Vacant(vac) => {
                vac.insert_entry(TrackedCopy {
                    released_at: Instant::now(),
                    size,
                });
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
            }
            Entry::Occupied(mut occ) => {
                let old_size = occ.get().size;
                occ.get_mut().size = size;
                occ.get_mut().released_at = Instant::now();

                if old_size <= size {
                    self.total_bytes
                        .fetch_add(size - old_size, Ordering::Relaxed);
                } else {
                    self.total_bytes
                        .fetch_sub(old_size - size, Ordering::Relaxed);
                }
            }
        }
    }

    /// Stop tracking `inode`. No-op when it is not tracked.
    pub fn untrack(&self, inode: Inode) {
        if let Some((_, entry)) = self.entries.remove_sync(&inode) {
            self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
        }
    }

    /// Total bytes across all tracked copies.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Number of tracked copies.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Inodes whose copy has been idle for longer than `max_age`.
    pub async fn stale_entries(&self, max_age: Duration) -> Vec<Inode> {
        let Some(cutoff) = Instant::now().checked_sub(max_age) else {
            return Vec::new();
        };
        let mut stale = Vec::new();

        self.entries
            .iter_async(|key, value| {
                if value.released_at < cutoff {
                    stale.push(*key);
                }
                true
            })
            .await;

        stale
    }
}

impl Default for CacheTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn track_same_inode_replaces_size() {
        let tracker = CacheTracker::new();
        tracker.track(1, 100);
        tracker.track(2, 250);
        tracker.track(1, 60);

        assert_eq!(tracker.estimated_size(), 310);
        assert_eq!(tracker.entry_count(), 2);
    }

    #[tokio::test]
    async fn untrack_missing_inode_is_noop() {
        let tracker = CacheTracker::new();
        tracker.track(1, 100);
        tracker.untrack(7);
        tracker.untrack(1);

        assert_eq!(tracker.estimated_size(), 0);
        assert_eq!(tracker.entry_count(), 0);
    }

    #[tokio::test]
    async fn stale_entries_only_returns_old_copies() {
        let tracker = CacheTracker::new();
        tracker.track(1, 50);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.track(2, 50);

        let stale = tracker.stale_entries(Duration::from_millis(25)).await;
        assert_eq!(stale, vec![1]);
        assert!(tracker.stale_entries(Duration::from_secs(60)).await.is_empty());
    }
}
