//! Reference counting for resources whose cleanup needs an external context.
//!
//! The FUSE adapter uses a [`DropWard`] to count the kernel's lookups of each inode: the kernel
//! takes a reference on every successful `lookup`/`create`/`mkdir` and gives them back in bulk with
//! `forget`. When the count reaches zero the inode is dropped from the adapter's node table.
//!
//! The cleanup is selected at the type level through a zero-sized tag implementing
//! [`StatelessDrop`], so the ward stores nothing per key besides the count.

use std::marker::PhantomData;

use rustc_hash::FxHashMap;

/// Cleanup hook invoked by a [`DropWard`] when a key's count reaches zero.
///
/// Implement this on a zero-sized tag type. The tag is never instantiated.
pub trait StatelessDrop<Ctx, K> {
    /// Release whatever `ctx` holds for `key`.
    ///
    /// Runs synchronously inside [`DropWard::dec_count`]. The key is still tracked while this runs, so
    /// a panic leaves it at a count of one and a later decrement retries the cleanup.
    fn delete(ctx: &Ctx, key: &K);
}

/// Per-key reference counts that call [`StatelessDrop::delete`] when a count drops to zero.
///
/// Not thread-safe: every mutation takes `&mut self`.
#[derive(Debug, Clone)]
pub struct DropWard<Ctx, K, T> {
    map: FxHashMap<K, usize>,
    ctx: Ctx,
    _marker: PhantomData<T>,
}

impl<Ctx, K, T> DropWard<Ctx, K, T>
where
    K: Eq + std::hash::Hash,
    T: StatelessDrop<Ctx, K>,
{
    const _ASSERT_ZST: () = assert!(size_of::<T>() == 0, "T must be zero-sized");

    /// Create a ward that hands `ctx` to `T::delete`.
    pub fn new(ctx: Ctx) -> Self {
        Self {
            map: FxHashMap::default(),
            ctx,
            _marker: PhantomData,
        }
    }

    /// The context passed to `T::delete`.
    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }

    /// Increment the count for `key`, starting at 1. Returns the new count.
    pub fn inc(&mut self, key: K) -> usize {
        *self
            .map
            .entry(key)
            .and_modify(|count| *count += 1)
            .or_insert(1)
    }

    /// The current count for `key`, zero when untracked.
    pub fn count(&self, key: &K) -> usize {
        self.map.get(key).copied().unwrap_or(0)
    }

    /// Decrement the count for `key` by `count`, saturating at zero.
    ///
    /// At zero, `T::delete` runs and the key is untracked. Returns `None` if `key` was not
    /// tracked.
    pub fn dec_count(&mut self, key: &K, count: usize) -> Option<usize> {
        let slot = self.map.get_mut(key)?;
        let new_count = slot.saturating_sub(count);
        if new_count > 0 {
            *slot = new_count;
            return Some(new_count);
        }
        *slot = 1;
        T::delete(&self.ctx, key);
        self.map.remove(key);
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    type Inode = u64;

    /// Table of inodes the kernel still references, plus a one-shot failure switch.
    #[derive(Default)]
    struct Table {
        live: RefCell<Vec<Inode>>,
        fail_once: Cell<bool>,
    }

    struct Unlink;

    impl StatelessDrop<Table, Inode> for Unlink {
        fn delete(table: &Table, inode: &Inode) {
            assert!(!table.fail_once.replace(false), "cleanup of {inode} failed");
            table.live.borrow_mut().retain(|i| i != inode);
        }
    }

    fn ward(inodes: &[Inode]) -> DropWard<Table, Inode, Unlink> {
        DropWard::new(Table {
            live: RefCell::new(inodes.to_vec()),
            ..Table::default()
        })
    }

    #[test]
    fn cleanup_runs_when_the_last_reference_goes() {
        let mut ward = ward(&[2, 3]);
        ward.inc(2);
        ward.inc(2);
        ward.inc(3);

        assert_eq!(ward.dec_count(&2, 1), Some(1));
        assert_eq!(*ward.ctx().live.borrow(), [2, 3]);
        assert_eq!(ward.dec_count(&2, 4), Some(0));
        assert_eq!(*ward.ctx().live.borrow(), [3]);
        assert_eq!(ward.count(&2), 0);
        assert_eq!(ward.dec_count(&2, 1), None);
    }

    #[test]
    fn failed_cleanup_is_retried_on_the_next_decrement() {
        let mut ward = ward(&[7]);
        ward.inc(7);
        ward.inc(7);
        ward.ctx().fail_once.set(true);

        let failed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ward.dec_count(&7, 2);
        }));
        assert!(failed.is_err());
        assert_eq!(ward.count(&7), 1);
        assert_eq!(*ward.ctx().live.borrow(), [7]);

        assert_eq!(ward.dec_count(&7, 1), Some(0));
        assert!(ward.ctx().live.borrow().is_empty());
    }
}
