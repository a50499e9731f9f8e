//! Directory nodes.
//!
//! A [`Dir`] owns its children through its [`DirCache`] and points back at its parent weakly, so
//! dropping a subtree from a listing frees it. Lookups refresh the listing from the backend when it
//! is older than the configured TTL; local mutations are applied to the listing first and marked as
//! virtual until a later listing confirms them.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::SystemTime;

use rustc_hash::FxHashSet;
use tracing::{debug, error, instrument, trace};

use super::dcache::{DirCache, Listing, RefreshGuard, RefreshStatus, Virtual};
use super::vfs::VfsContext;
use super::{Attr, File, Inode, Node, NodeKind, ROOT_INODE, VfsError, next_inode};
use crate::backend::{BackendError, Entry, join_path, parent_path};

/// A directory in the tree.
pub struct Dir {
    ctx: Arc<VfsContext>,
    inode: Inode,
    parent: RwLock<Weak<Dir>>,
    name: RwLock<String>,
    is_root: bool,
    mod_time: Mutex<SystemTime>,
    cache: DirCache,
    /// Serializes mutations of this directory's children.
    mutations: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Dir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dir")
            .field("inode", &self.inode)
            .field("name", &self.name())
            .field("is_root", &self.is_root)
            .finish_non_exhaustive()
    }
}

impl Dir {
    pub(crate) fn new_root(ctx: Arc<VfsContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inode: ROOT_INODE,
            parent: RwLock::new(Weak::new()),
            name: RwLock::new(String::new()),
            is_root: true,
            mod_time: Mutex::new(SystemTime::now()),
            cache: DirCache::new(),
            mutations: tokio::sync::Mutex::new(()),
        })
    }

    /// A child directory. `listed` marks directories created locally, which start out empty and
    /// fresh instead of being listed on first access.
    fn new_child(
        ctx: Arc<VfsContext>,
        parent: &Arc<Self>,
        name: String,
        mod_time: SystemTime,
        listed: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inode: next_inode(),
            parent: RwLock::new(Arc::downgrade(parent)),
            name: RwLock::new(name),
            is_root: false,
            mod_time: Mutex::new(mod_time),
            cache: if listed {
                DirCache::new_listed()
            } else {
                DirCache::new()
            },
            mutations: tokio::sync::Mutex::new(()),
        })
    }

    /// The inode number.
    #[must_use]
    pub fn inode(&self) -> Inode {
        self.inode
    }

    /// Whether this is the root of the tree.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// The leaf name. Empty for the root.
    #[must_use]
    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The parent directory. `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .upgrade()
    }

    /// The path from the root. Empty for the root.
    #[must_use]
    pub fn path(&self) -> String {
        if self.is_root {
            return String::new();
        }
        let name = self.name();
        let parent = self.parent();
        debug_assert!(parent.is_some(), "directory {name} has no parent");
        match parent {
            Some(parent) => join_path(&parent.path(), &name),
            None => {
                error!(inode = self.inode, name, "directory lost its parent");
                name
            }
        }
    }

    /// A snapshot of the directory's attributes.
    #[must_use]
    pub fn attr(&self) -> Attr {
        Attr {
            inode: self.inode,
            kind: NodeKind::Directory,
            size: 0,
            perms: self.ctx.dir_perms,
            uid: self.ctx.options.uid,
            gid: self.ctx.options.gid,
            mod_time: *self
                .mod_time
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        }
    }

    fn touch(&self, mod_time: SystemTime) {
        *self
            .mod_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = mod_time;
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Self>, name: String) {
        *self
            .parent
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::downgrade(parent);
        *self
            .name
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = name;
    }

    /// Take this directory's mutation lock.
    pub(crate) async fn lock_mutations(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mutations.lock().await
    }

    /// Bring the listing up to date if it is older than the TTL.
    ///
    /// Once a listing exists, callers never wait for a refresh somebody else started; they read
    /// the previous snapshot instead.
    #[instrument(name = "Dir::refresh", skip(self), fields(inode = self.inode))]
    async fn refresh(self: &Arc<Self>) -> Result<(), VfsError> {
        let ttl = self.ctx.options.dir_cache_time;
        loop {
            match self.cache.try_claim_refresh(ttl) {
                RefreshStatus::Fresh => return Ok(()),
                RefreshStatus::InProgress => {
                    if self.cache.has_listing() {
                        return Ok(());
                    }
                    self.cache.wait_refresh().await;
                }
                RefreshStatus::Claimed(generation) => {
                    let mut guard = RefreshGuard::new(&self.cache);
                    let path = self.path();
                    let entries = match self.ctx.backend.list(&path).await {
                        Ok(entries) => entries,
                        Err(BackendError::NotFound(_)) => {
                            debug!(path, "directory missing on backend, treating as empty");
                            Vec::new()
                        }
                        Err(e) => return Err(e.into()),
                    };
                    trace!(path, count = entries.len(), "listed directory");
                    let applied = self
                        .cache
                        .finish_refresh(generation, |listing| self.merge(listing, entries));
                    guard.defuse();
                    if applied {
                        return Ok(());
                    }
                    debug!(path, "listing raced an invalidation, listing again");
                }
            }
        }
    }

    /// Fold a backend listing into the cached one.
    ///
    /// Existing nodes are kept when the listing shows the same kind under the same name, so inodes
    /// stay stable. Entries the listing omits survive only while they are unconfirmed local
    /// creations or still in use.
    fn merge(self: &Arc<Self>, listing: &mut Listing, entries: Vec<Entry>) {
        let mut items = std::collections::BTreeMap::new();
        let mut listed = FxHashSet::default();

        for entry in entries {
            let name = entry.leaf().to_owned();
            if name.is_empty() {
                continue;
            }
            listed.insert(name.clone());
            match listing.virtuals.get(&name) {
                Some(Virtual::Removed) => continue,
                Some(Virtual::Added) => {
                    listing.virtuals.remove(&name);
                }
                None => {}
            }
            let node = match (entry, listing.items.remove(&name)) {
                (Entry::Object(info), Some(Node::File(file))) => {
                    file.observe_remote(info);
                    Node::File(file)
                }
                (Entry::Dir(info), Some(Node::Dir(dir))) => {
                    dir.touch(info.mod_time);
                    Node::Dir(dir)
                }
                (Entry::Object(info), _) => Node::File(File::new_remote(
                    Arc::clone(&self.ctx),
                    self,
                    name.clone(),
                    info,
                )),
                (Entry::Dir(info), _) => Node::Dir(Self::new_child(
                    Arc::clone(&self.ctx),
                    self,
                    name.clone(),
                    info.mod_time,
                    false,
                )),
            };
            items.insert(name, node);
        }

        for (name, node) in std::mem::take(&mut listing.items) {
            let keep = listing.virtuals.get(&name) == Some(&Virtual::Added)
                || match &node {
                    Node::File(file) => file.is_pending(),
                    Node::Dir(dir) => dir.is_busy(),
                };
            if keep {
                items.entry(name).or_insert(node);
            } else {
                trace!(name, "dropping entry missing from listing");
            }
        }

        listing
            .virtuals
            .retain(|name, marker| *marker == Virtual::Added || listed.contains(name));
        listing.items = items;
    }

    /// Whether anything below this directory must survive a listing that omits it.
    pub(crate) fn is_busy(&self) -> bool {
        let listing = self.cache.read();
        listing.virtuals.values().any(|v| *v == Virtual::Added)
            || listing.items.values().any(|node| match node {
                Node::File(file) => file.is_pending(),
                Node::Dir(dir) => dir.is_busy(),
            })
    }

    /// Look up `name`, refreshing the listing if it is stale.
    pub async fn stat(self: &Arc<Self>, name: &str) -> Result<Node, VfsError> {
        self.refresh().await?;
        self.cached_child(name).ok_or(VfsError::NotExist)
    }

    /// Look up `name` in the cached listing without touching the backend.
    #[must_use]
    pub fn cached_child(&self, name: &str) -> Option<Node> {
        self.cache.read().items.get(name).cloned()
    }

    /// Every child, sorted by name.
    pub async fn read_dir_all(self: &Arc<Self>) -> Result<Vec<Node>, VfsError> {
        self.refresh().await?;
        Ok(self.cache.read().items.values().cloned().collect())
    }

    /// Whether the directory has no children.
    pub async fn is_empty(self: &Arc<Self>) -> Result<bool, VfsError> {
        self.refresh().await?;
        Ok(self.cache.read().items.is_empty())
    }

    /// Create a file node named `name`, or return the existing node unless `exclusive`.
    ///
    /// Nothing reaches the backend until the file is written and closed.
    #[instrument(name = "Dir::create_file", skip(self), fields(inode = self.inode))]
    pub async fn create_file(
        self: &Arc<Self>,
        name: &str,
        exclusive: bool,
    ) -> Result<Node, VfsError> {
        self.ctx.check_writable()?;
        self.refresh().await?;
        let _mutations = self.lock_mutations().await;
        let mut listing = self.cache.write();
        if let Some(existing) = listing.items.get(name) {
            return if exclusive {
                Err(VfsError::AlreadyExists)
            } else {
                Ok(existing.clone())
            };
        }
        let file = File::new_local(Arc::clone(&self.ctx), self, name.to_owned());
        let node = Node::File(file);
        listing.add_virtual(name.to_owned(), node.clone());
        drop(listing);
        self.touch(SystemTime::now());
        debug!(name, "created file");
        Ok(node)
    }

    /// Create the subdirectory `name` on the backend and in the tree.
    #[instrument(name = "Dir::mkdir", skip(self), fields(inode = self.inode))]
    pub async fn mkdir(self: &Arc<Self>, name: &str) -> Result<Arc<Self>, VfsError> {
        self.ctx.check_writable()?;
        self.refresh().await?;
        let _mutations = self.lock_mutations().await;

        let dir = Self::new_child(
            Arc::clone(&self.ctx),
            self,
            name.to_owned(),
            SystemTime::now(),
            true,
        );
        let previous_marker = {
            let mut listing = self.cache.write();
            if listing.items.contains_key(name) {
                return Err(VfsError::AlreadyExists);
            }
            let marker = listing.virtuals.get(name).copied();
            listing.add_virtual(name.to_owned(), Node::Dir(Arc::clone(&dir)));
            marker
        };

        let path = join_path(&self.path(), name);
        if let Err(e) = self.ctx.backend.mkdir(&path).await {
            self.cache.write().restore(name, None, previous_marker);
            return Err(e.into());
        }
        self.touch(SystemTime::now());
        debug!(path, "created directory");
        Ok(dir)
    }

    /// Remove the child `name`. Directories must be empty.
    #[instrument(name = "Dir::remove", skip(self), fields(inode = self.inode))]
    pub async fn remove(self: &Arc<Self>, name: &str) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        self.refresh().await?;
        let _mutations = self.lock_mutations().await;
        self.remove_locked(name).await
    }

    /// [`Self::remove`] for callers already holding the mutation lock.
    pub(crate) async fn remove_locked(self: &Arc<Self>, name: &str) -> Result<(), VfsError> {
        let node = self.cached_child(name).ok_or(VfsError::NotExist)?;
        if let Node::Dir(dir) = &node
            && !dir.is_empty().await?
        {
            return Err(VfsError::NotEmpty);
        }

        let (removed, previous_marker) = {
            let mut listing = self.cache.write();
            let marker = listing.virtuals.get(name).copied();
            (listing.remove_virtual(name), marker)
        };

        let result = match &node {
            Node::Dir(dir) => match self.ctx.backend.rmdir(&dir.path()).await {
                Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
                Err(e) => Err(e.into()),
            },
            Node::File(file) => file.remove_remote().await,
        };
        if let Err(e) = result {
            self.cache.write().restore(name, removed, previous_marker);
            return Err(e);
        }
        self.touch(SystemTime::now());
        debug!(name, "removed");
        Ok(())
    }

    /// Forget this directory's listing and every cached listing below it.
    pub fn flush_dir_cache(&self) {
        self.cache.invalidate();
        let children: Vec<Arc<Self>> = self
            .cache
            .read()
            .items
            .values()
            .filter_map(|node| node.as_dir().cloned())
            .collect();
        for child in children {
            child.flush_dir_cache();
        }
    }

    /// Invalidate the cached listing holding `path`, as reported by a change notification.
    ///
    /// Walks only directories already cached. When the walk stops early, the deepest cached
    /// ancestor is invalidated instead.
    pub(crate) fn invalidate_path(self: &Arc<Self>, path: &str, is_dir: bool) {
        let mut dir = Arc::clone(self);
        let mut reached = true;
        for segment in parent_path(path).split('/').filter(|s| !s.is_empty()) {
            match dir.cached_child(segment) {
                Some(Node::Dir(child)) => dir = child,
                Some(Node::File(_)) | None => {
                    reached = false;
                    break;
                }
            }
        }
        debug!(path, is_dir, dir = dir.path(), "invalidating cached listing");
        dir.cache.invalidate();
        if reached
            && is_dir
            && let Some(Node::Dir(target)) = dir.cached_child(crate::backend::leaf_name(path))
        {
            target.cache.invalidate();
        }
    }

    /// Move `node` from `old_name` in `old_dir` to `new_name` in `new_dir` in the tree only.
    pub(crate) fn relink(
        old_dir: &Arc<Self>,
        old_name: &str,
        new_dir: &Arc<Self>,
        new_name: &str,
        node: Node,
    ) {
        old_dir.cache.write().remove_virtual(old_name);
        match &node {
            Node::File(file) => file.set_parent(new_dir, new_name.to_owned()),
            Node::Dir(dir) => dir.set_parent(new_dir, new_name.to_owned()),
        }
        new_dir.cache.write().add_virtual(new_name.to_owned(), node);
        let now = SystemTime::now();
        old_dir.touch(now);
        new_dir.touch(now);
    }

    /// Whether `self` is `other` or one of its ancestors.
    fn contains(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        let mut cur = Some(Arc::clone(other));
        while let Some(dir) = cur {
            if Arc::ptr_eq(&dir, self) {
                return true;
            }
            cur = dir.parent();
        }
        false
    }

    /// Move this directory to `new_name` in `new_dir`. Needs server-side directory moves.
    #[instrument(name = "Dir::move_to", skip(self, new_dir), fields(inode = self.inode))]
    pub(crate) async fn move_to(
        self: &Arc<Self>,
        new_dir: &Arc<Self>,
        new_name: &str,
    ) -> Result<(), VfsError> {
        if self.is_root || self.contains(new_dir) {
            return Err(VfsError::InvalidArgument);
        }
        let old_dir = self.parent().ok_or(VfsError::NotExist)?;
        let dir_mover = self
            .ctx
            .backend
            .dir_mover()
            .ok_or(VfsError::Unsupported)?;

        let old_name = self.name();
        let from = self.path();
        let to = join_path(&new_dir.path(), new_name);
        dir_mover.move_dir(&from, &to).await?;
        debug!(from, to, "moved directory");

        Self::relink(&old_dir, &old_name, new_dir, new_name, Node::Dir(Arc::clone(self)));
        Ok(())
    }
}
