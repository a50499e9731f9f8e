//! The façade bridges talk to.
//!
//! [`Vfs`] resolves slash separated paths against the node tree and forwards to [`Dir`], [`File`]
//! and the handles. It also owns the background work: invalidating listings on remote change
//! notifications and enforcing the full-mode cache limits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::handle::DirHandle;
use super::{Dir, FsUsage, Handle, InodePerms, Node, OpenFlags, VfsError, VfsOptions};
use crate::backend::{Backend, Features};
use crate::cache::{CacheEngine, CacheMode};

/// Counts handles open for writing so mode switches and shutdown can wait for them.
#[derive(Debug, Default)]
pub(crate) struct WriterGauge {
    count: AtomicUsize,
    idle: Notify,
}

impl WriterGauge {
    pub(crate) fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "writer gauge underflow");
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until no writer is open. Returns `false` on timeout.
    pub(crate) async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let mut notified = std::pin::pin!(self.idle.notified());
                notified.as_mut().enable();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// State shared by every node of one [`Vfs`].
pub(crate) struct VfsContext {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) features: Features,
    pub(crate) options: VfsOptions,
    /// Directory permissions with the umask applied.
    pub(crate) dir_perms: InodePerms,
    /// File permissions with the umask applied.
    pub(crate) file_perms: InodePerms,
    pub(crate) cache: CacheEngine,
    pub(crate) writers: WriterGauge,
}

impl std::fmt::Debug for VfsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsContext")
            .field("backend", &self.backend.name())
            .field("features", &self.features)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl VfsContext {
    pub(crate) fn check_writable(&self) -> Result<(), VfsError> {
        if self.options.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

/// Split a path into its non-empty segments. `.` segments are dropped.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

fn clean_path(path: &str) -> String {
    segments(path).collect::<Vec<_>>().join("/")
}

fn usage_value(value: Option<u64>) -> i64 {
    value.and_then(|v| i64::try_from(v).ok()).unwrap_or(-1)
}

/// A virtual filesystem over one backend.
pub struct Vfs {
    ctx: Arc<VfsContext>,
    root: Arc<Dir>,
    usage: tokio::sync::Mutex<Option<(Instant, FsUsage)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("ctx", &self.ctx)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Vfs {
    /// Build a filesystem over `backend`. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, options: VfsOptions) -> Self {
        let features = Features::detect(backend.as_ref());
        info!(backend = backend.name(), ?features, mode = %options.cache_mode, "creating vfs");
        let ctx = Arc::new(VfsContext {
            dir_perms: InodePerms::from_mode(options.dir_perms).masked(options.umask),
            file_perms: InodePerms::from_mode(options.file_perms).masked(options.umask),
            cache: CacheEngine::new(&options),
            writers: WriterGauge::default(),
            backend,
            features,
            options,
        });
        let root = Dir::new_root(Arc::clone(&ctx));

        let mut tasks = Vec::new();
        if let Some(notifier) = ctx.backend.change_notifier() {
            tasks.push(spawn_change_listener(notifier.subscribe(), Arc::downgrade(&root)));
        }
        if !ctx.options.cache_poll_interval.is_zero() {
            tasks.push(spawn_cache_cleaner(
                Arc::downgrade(&ctx),
                ctx.options.cache_poll_interval,
            ));
        }

        Self {
            ctx,
            root,
            usage: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(tasks),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Arc<Dir> {
        &self.root
    }

    /// The options this instance was built with. The cache mode may since have changed.
    #[must_use]
    pub fn options(&self) -> &VfsOptions {
        &self.ctx.options
    }

    /// The optional capabilities the backend offers.
    #[must_use]
    pub fn features(&self) -> Features {
        self.ctx.features
    }

    /// The current cache mode.
    #[must_use]
    pub fn cache_mode(&self) -> CacheMode {
        self.ctx.cache.mode()
    }

    /// The cache engine, for inspecting the staging area.
    #[must_use]
    pub fn cache(&self) -> &CacheEngine {
        &self.ctx.cache
    }

    /// Resolve `path` to a node.
    #[instrument(name = "Vfs::stat", skip(self))]
    pub async fn stat(&self, path: &str) -> Result<Node, VfsError> {
        let mut node = Node::Dir(Arc::clone(&self.root));
        for segment in segments(path) {
            node = match node {
                Node::Dir(dir) => dir.stat(segment).await?,
                Node::File(_) => return Err(VfsError::NotDir),
            };
        }
        Ok(node)
    }

    /// Resolve the directory holding `path` and return it with the leaf name.
    ///
    /// The leaf itself need not exist. A file in the middle of the path fails with
    /// [`VfsError::AlreadyExists`]. The root resolves to itself with an empty leaf.
    #[instrument(name = "Vfs::stat_parent", skip(self))]
    pub async fn stat_parent(&self, path: &str) -> Result<(Arc<Dir>, String), VfsError> {
        let parts: Vec<&str> = segments(path).collect();
        let Some((leaf, parents)) = parts.split_last() else {
            return Ok((Arc::clone(&self.root), String::new()));
        };
        let mut dir = Arc::clone(&self.root);
        for segment in parents {
            dir = match dir.stat(segment).await? {
                Node::Dir(child) => child,
                Node::File(_) => return Err(VfsError::AlreadyExists),
            };
        }
        Ok((dir, (*leaf).to_owned()))
    }

    /// Open `path`, creating a file with `O_CREAT` when it is missing.
    ///
    /// Permission bits come from the configured templates, so `_perm` is ignored.
    #[instrument(name = "Vfs::open_file", skip(self))]
    pub async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        _perm: u32,
    ) -> Result<Handle, VfsError> {
        let (dir, leaf) = self.stat_parent(path).await?;
        if leaf.is_empty() {
            return self.open_node(&Node::Dir(dir), flags).await;
        }
        let node = match dir.stat(&leaf).await {
            Ok(node) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(VfsError::AlreadyExists);
                }
                node
            }
            Err(VfsError::NotExist) if flags.contains(OpenFlags::CREAT) => {
                dir.create_file(&leaf, flags.contains(OpenFlags::EXCL))
                    .await?
            }
            Err(e) => return Err(e),
        };
        self.open_node(&node, flags).await
    }

    /// Open an already resolved node.
    pub async fn open_node(&self, node: &Node, flags: OpenFlags) -> Result<Handle, VfsError> {
        match node {
            Node::Dir(dir) => {
                let access = flags.access_mode().ok_or(VfsError::PermissionDenied)?;
                if access.can_write() {
                    return Err(VfsError::IsDir);
                }
                Ok(Handle::Dir(DirHandle::open(dir).await?))
            }
            Node::File(file) => file.open(flags).await,
        }
    }

    /// Create the file `name` in `dir` and open it.
    pub async fn create_in(
        &self,
        dir: &Arc<Dir>,
        name: &str,
        flags: OpenFlags,
    ) -> Result<Handle, VfsError> {
        let node = dir
            .create_file(name, flags.contains(OpenFlags::EXCL))
            .await?;
        self.open_node(&node, flags).await
    }

    /// Create the directory at `path`.
    pub async fn mkdir(&self, path: &str) -> Result<Arc<Dir>, VfsError> {
        self.ctx.check_writable()?;
        let (dir, leaf) = self.stat_parent(path).await?;
        if leaf.is_empty() {
            return Err(VfsError::AlreadyExists);
        }
        dir.mkdir(&leaf).await
    }

    /// Remove the file or empty directory at `path`.
    pub async fn remove(&self, path: &str) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        let (dir, leaf) = self.stat_parent(path).await?;
        if leaf.is_empty() {
            return Err(VfsError::InvalidArgument);
        }
        dir.remove(&leaf).await
    }

    /// Every child of the directory at `path`, sorted by name.
    pub async fn read_dir_all(&self, path: &str) -> Result<Vec<Node>, VfsError> {
        match self.stat(path).await? {
            Node::Dir(dir) => dir.read_dir_all().await,
            Node::File(_) => Err(VfsError::NotDir),
        }
    }

    /// Move `old` to `new`, replacing a file or an empty directory there.
    #[instrument(name = "Vfs::rename", skip(self))]
    pub async fn rename(&self, old: &str, new: &str) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        if clean_path(old) == clean_path(new) {
            return Ok(());
        }
        let (old_dir, old_leaf) = self.stat_parent(old).await?;
        let (new_dir, new_leaf) = self.stat_parent(new).await?;
        if old_leaf.is_empty() || new_leaf.is_empty() {
            return Err(VfsError::InvalidArgument);
        }
        self.rename_in(&old_dir, &old_leaf, &new_dir, &new_leaf).await
    }

    /// [`Self::rename`] with both parents already resolved.
    pub async fn rename_in(
        &self,
        old_dir: &Arc<Dir>,
        old_name: &str,
        new_dir: &Arc<Dir>,
        new_name: &str,
    ) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        if Arc::ptr_eq(old_dir, new_dir) && old_name == new_name {
            return Ok(());
        }
        let node = old_dir.stat(old_name).await?;
        let target = match new_dir.stat(new_name).await {
            Ok(target) => Some(target),
            Err(VfsError::NotExist) => None,
            Err(e) => return Err(e),
        };

        // Lock in inode order so concurrent renames cannot deadlock.
        let (first, second) = if old_dir.inode() <= new_dir.inode() {
            (old_dir, new_dir)
        } else {
            (new_dir, old_dir)
        };
        let _first = first.lock_mutations().await;
        let _second = if Arc::ptr_eq(first, second) {
            None
        } else {
            Some(second.lock_mutations().await)
        };

        let mut replaced = None;
        match (&node, target) {
            (_, None) => {}
            (_, Some(target)) if target.same(&node) => return Ok(()),
            (Node::File(_), Some(Node::Dir(_))) => return Err(VfsError::IsDir),
            (Node::Dir(_), Some(Node::File(_))) => return Err(VfsError::NotDir),
            (Node::Dir(_), Some(Node::Dir(target))) => {
                if !target.is_empty().await? {
                    return Err(VfsError::NotEmpty);
                }
                new_dir.remove_locked(new_name).await?;
            }
            (Node::File(_), Some(Node::File(target))) => replaced = Some(target),
        }

        match &node {
            Node::File(file) => file.move_to(new_dir, new_name).await?,
            Node::Dir(dir) => dir.move_to(new_dir, new_name).await?,
        }
        if let Some(replaced) = replaced {
            debug!(inode = replaced.inode(), "file replaced by rename");
            replaced.mark_unlinked();
            self.ctx.cache.forget(replaced.inode()).await;
        }
        Ok(())
    }

    /// Set the modification time of the node at `path`.
    pub async fn set_mod_time(&self, path: &str, mod_time: SystemTime) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        match self.stat(path).await? {
            Node::File(file) => file.set_mod_time(mod_time).await,
            Node::Dir(_) => {
                debug!(path, "ignoring modification time on a directory");
                Ok(())
            }
        }
    }

    /// Change the length of the file at `path`.
    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        let node = self.stat(path).await?;
        self.truncate_node(&node, size).await
    }

    /// Change the length of an already resolved file.
    pub async fn truncate_node(&self, node: &Node, size: u64) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        if node.is_dir() {
            return Err(VfsError::IsDir);
        }
        let mut handle = if size == 0 {
            self.open_node(node, OpenFlags::WRONLY | OpenFlags::TRUNC)
                .await?
        } else {
            let mut handle = self.open_node(node, OpenFlags::RDWR).await?;
            if let Err(e) = handle.truncate(size).await {
                if let Err(close_err) = handle.close().await {
                    debug!(error = %close_err, "close after failed truncate");
                }
                return Err(e);
            }
            handle
        };
        handle.close().await
    }

    /// Storage usage. Answers are reused for `usage_cache_time`, and concurrent callers share one
    /// backend query.
    #[instrument(name = "Vfs::statfs", skip(self))]
    pub async fn statfs(&self) -> FsUsage {
        let mut cached = self.usage.lock().await;
        if let Some((at, usage)) = *cached
            && at.elapsed() < self.ctx.options.usage_cache_time
        {
            return usage;
        }
        let usage = match self.ctx.backend.about() {
            None => FsUsage::UNKNOWN,
            Some(about) => match about.about().await {
                Ok(u) => FsUsage {
                    total: usage_value(u.total),
                    used: usage_value(u.used),
                    free: usage_value(u.free),
                },
                Err(e) => {
                    warn!(error = %e, "could not query backend usage");
                    FsUsage::UNKNOWN
                }
            },
        };
        *cached = Some((Instant::now(), usage));
        usage
    }

    /// Wait until no handle is open for writing. Returns `false` on timeout.
    pub async fn wait_for_writers(&self, timeout: Duration) -> bool {
        self.ctx.writers.wait_idle(timeout).await
    }

    /// Number of handles currently open for writing.
    #[must_use]
    pub fn open_writers(&self) -> usize {
        self.ctx.writers.count()
    }

    /// Switch the cache mode.
    ///
    /// Waits up to `write_wait` for writers to finish, then drops idle staged copies and every
    /// cached listing.
    #[instrument(name = "Vfs::set_cache_mode", skip(self))]
    pub async fn set_cache_mode(&self, mode: CacheMode) {
        if !self.wait_for_writers(self.ctx.options.write_wait).await {
            warn!(
                writers = self.ctx.writers.count(),
                "writers still open, switching cache mode anyway"
            );
        }
        self.ctx.cache.set_mode(mode);
        self.ctx.cache.purge().await;
        self.root.flush_dir_cache();
    }

    /// Forget every cached listing.
    pub fn flush_dir_cache(&self) {
        self.root.flush_dir_cache();
    }

    /// Apply the full-mode size and age limits now.
    pub async fn enforce_cache_limits(&self) {
        self.ctx.cache.enforce_limits().await;
    }

    /// A public link to the file at `path`.
    pub async fn public_link(&self, path: &str) -> Result<String, VfsError> {
        let linker = self
            .ctx
            .backend
            .public_linker()
            .ok_or(VfsError::Unsupported)?;
        let node = self.stat(path).await?;
        Ok(linker.public_link(&node.path()).await?)
    }

    /// The storage tier of the file at `path`.
    pub async fn tier(&self, path: &str) -> Result<String, VfsError> {
        let tiering = self.ctx.backend.tiering().ok_or(VfsError::Unsupported)?;
        match self.stat(path).await? {
            Node::File(file) => Ok(tiering.tier(&file.path()).await?),
            Node::Dir(_) => Err(VfsError::IsDir),
        }
    }

    /// Move the file at `path` to another storage tier.
    pub async fn set_tier(&self, path: &str, tier: &str) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        let tiering = self.ctx.backend.tiering().ok_or(VfsError::Unsupported)?;
        match self.stat(path).await? {
            Node::File(file) => Ok(tiering.set_tier(&file.path(), tier).await?),
            Node::Dir(_) => Err(VfsError::IsDir),
        }
    }

    /// Delete staged copies nobody uses. Safe to call repeatedly.
    pub async fn clean_up(&self) -> Result<(), VfsError> {
        self.ctx.cache.clean_up().await
    }

    /// Stop background work, wait for writers, and clean up. Later calls do nothing.
    #[instrument(name = "Vfs::shutdown", skip(self))]
    pub async fn shutdown(&self) -> Result<(), VfsError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.abort_tasks();
        if !self.wait_for_writers(self.ctx.options.write_wait).await {
            warn!(
                writers = self.ctx.writers.count(),
                "shutting down with writers still open"
            );
        }
        self.clean_up().await?;
        info!("vfs shut down");
        Ok(())
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn spawn_change_listener(
    mut events: tokio::sync::mpsc::UnboundedReceiver<crate::backend::ChangeEvent>,
    root: Weak<Dir>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(root) = root.upgrade() else {
                break;
            };
            root.invalidate_path(&event.path, event.is_dir);
        }
        debug!("change notification feed ended");
    })
}

fn spawn_cache_cleaner(ctx: Weak<VfsContext>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(ctx) = ctx.upgrade() else {
                break;
            };
            if ctx.cache.mode() == CacheMode::Full {
                ctx.cache.enforce_limits().await;
            }
        }
    })
}
