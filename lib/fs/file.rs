//! File nodes.
//!
//! A [`File`] pairs the remote object (absent until the first upload) with local bookkeeping: open
//! counts, the size and modification time the VFS reports, and a change counter that decides
//! whether a staged copy must be uploaded. At most one upload per file runs at a time, serialized
//! by `upload_lock`.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::SystemTime;

use tokio::io::AsyncWriteExt as _;
use tracing::{debug, error, instrument, warn};

use super::handle::{ReadHandle, RwHandle, WriteHandle};
use super::vfs::VfsContext;
use super::{AccessMode, Attr, Dir, Handle, Inode, NodeKind, OpenFlags, VfsError, next_inode};
use crate::backend::{BackendError, ObjectInfo, PutMeta, ReadRange, join_path};
use crate::cache::CacheMode;
use crate::cache::staging::{Fingerprint, StagedEntry};

#[derive(Debug)]
struct FileState {
    object: Option<ObjectInfo>,
    /// Size reported to callers. `None` until known.
    size: Option<u64>,
    mod_time: SystemTime,
    /// Set while writers are open; applied by the next upload.
    pending_mod_time: Option<SystemTime>,
    readers: usize,
    writers: usize,
    /// Bumped by every local modification.
    changes: u64,
    /// The value of `changes` the backend last accepted.
    saved: u64,
    /// Removed from the tree while open. Nothing is uploaded any more.
    unlinked: bool,
    /// An off-mode writer is streaming an upload to the path the file had when it started.
    streaming: bool,
}

impl FileState {
    fn dirty(&self) -> bool {
        self.changes != self.saved
    }
}

/// A regular file in the tree.
pub struct File {
    ctx: Arc<VfsContext>,
    inode: Inode,
    dir: RwLock<Weak<Dir>>,
    name: RwLock<String>,
    state: Mutex<FileState>,
    upload_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("inode", &self.inode)
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

fn fingerprint(object: &ObjectInfo) -> Fingerprint {
    Fingerprint {
        size: object.size,
        mod_time: object.mod_time,
    }
}

impl File {
    fn build(
        ctx: Arc<VfsContext>,
        dir: &Arc<Dir>,
        name: String,
        object: Option<ObjectInfo>,
        mod_time: SystemTime,
    ) -> Arc<Self> {
        let size = match &object {
            Some(o) => o.size,
            None => Some(0),
        };
        Arc::new(Self {
            ctx,
            inode: next_inode(),
            dir: RwLock::new(Arc::downgrade(dir)),
            name: RwLock::new(name),
            state: Mutex::new(FileState {
                object,
                size,
                mod_time,
                pending_mod_time: None,
                readers: 0,
                writers: 0,
                changes: 0,
                saved: 0,
                unlinked: false,
                streaming: false,
            }),
            upload_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// A node for an object reported by a backend listing.
    pub(crate) fn new_remote(
        ctx: Arc<VfsContext>,
        dir: &Arc<Dir>,
        name: String,
        object: ObjectInfo,
    ) -> Arc<Self> {
        let mod_time = object.mod_time;
        Self::build(ctx, dir, name, Some(object), mod_time)
    }

    /// A node for a file created locally and not uploaded yet.
    pub(crate) fn new_local(ctx: Arc<VfsContext>, dir: &Arc<Dir>, name: String) -> Arc<Self> {
        Self::build(ctx, dir, name, None, SystemTime::now())
    }

    fn lock_state(&self) -> MutexGuard<'_, FileState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn ctx(&self) -> &Arc<VfsContext> {
        &self.ctx
    }

    /// The inode number.
    #[must_use]
    pub fn inode(&self) -> Inode {
        self.inode
    }

    /// The leaf name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The containing directory, if it is still alive.
    #[must_use]
    pub fn dir(&self) -> Option<Arc<Dir>> {
        self.dir
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .upgrade()
    }

    /// The path from the root.
    #[must_use]
    pub fn path(&self) -> String {
        let name = self.name();
        let dir = self.dir();
        debug_assert!(dir.is_some(), "file {name} has no parent directory");
        match dir {
            Some(dir) => join_path(&dir.path(), &name),
            None => {
                error!(inode = self.inode, name, "file lost its parent directory");
                name
            }
        }
    }

    /// The backing object, absent until the first upload.
    ///
    /// The path is taken from the node's current position, which follows directory moves.
    #[must_use]
    pub fn object(&self) -> Option<ObjectInfo> {
        let path = self.path();
        let mut object = self.lock_state().object.clone()?;
        object.path = path;
        Some(object)
    }

    /// The size reported to callers. Zero while unknown.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.lock_state().size.unwrap_or(0)
    }

    /// The size, or `None` when the backend did not report one and nobody read to the end yet.
    #[must_use]
    pub fn known_size(&self) -> Option<u64> {
        self.lock_state().size
    }

    /// The modification time reported to callers, including a pending one.
    #[must_use]
    pub fn mod_time(&self) -> SystemTime {
        let state = self.lock_state();
        state.pending_mod_time.unwrap_or(state.mod_time)
    }

    /// Number of handles open for writing.
    #[must_use]
    pub fn open_writers(&self) -> usize {
        self.lock_state().writers
    }

    /// Number of handles open for reading only.
    #[must_use]
    pub fn open_readers(&self) -> usize {
        self.lock_state().readers
    }

    /// Whether local changes have not been accepted by the backend yet.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.lock_state().dirty()
    }

    /// A snapshot of the file's attributes.
    #[must_use]
    pub fn attr(&self) -> Attr {
        let state = self.lock_state();
        Attr {
            inode: self.inode,
            kind: NodeKind::File,
            size: state.size.unwrap_or(0),
            perms: self.ctx.file_perms,
            uid: self.ctx.options.uid,
            gid: self.ctx.options.gid,
            mod_time: state.pending_mod_time.unwrap_or(state.mod_time),
        }
    }

    /// Whether the node must survive a backend listing that does not show it.
    pub(crate) fn is_pending(&self) -> bool {
        let state = self.lock_state();
        !state.unlinked
            && (state.object.is_none() || state.writers > 0 || state.readers > 0 || state.dirty())
    }

    pub(crate) fn set_parent(&self, dir: &Arc<Dir>, name: String) {
        *self
            .dir
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::downgrade(dir);
        *self
            .name
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = name;
    }

    /// Adopt metadata from a backend listing, unless local state is newer.
    pub(crate) fn observe_remote(&self, object: ObjectInfo) {
        let mut state = self.lock_state();
        if state.writers > 0 || state.dirty() || state.unlinked {
            return;
        }
        match &state.object {
            None => return,
            Some(current) if *current == object || object.mod_time < current.mod_time => return,
            Some(_) => {}
        }
        debug!(inode = self.inode, path = object.path, "remote object changed");
        state.size = object.size;
        state.mod_time = object.mod_time;
        state.object = Some(object);
    }

    /// Record a local modification. `new_size` becomes visible right away only in full mode.
    pub(crate) fn mark_changed(&self, new_size: u64) {
        // Streaming writers report sizes too, but only full mode shows them before upload.
        let full = self.ctx.cache.mode() == CacheMode::Full;
        let mut state = self.lock_state();
        state.changes += 1;
        if state.pending_mod_time.is_none() {
            state.mod_time = SystemTime::now();
        }
        if full {
            state.size = Some(new_size);
        }
    }

    /// Record the size learnt by reading an object of unknown size to its end.
    pub(crate) fn learn_size(&self, size: u64) {
        let mut state = self.lock_state();
        if state.size.is_none() {
            debug!(inode = self.inode, size, "learnt size of object");
            state.size = Some(size);
        }
    }

    pub(crate) fn add_reader(&self) {
        self.lock_state().readers += 1;
    }

    pub(crate) fn remove_reader(&self) {
        let mut state = self.lock_state();
        state.readers = state.readers.saturating_sub(1);
    }

    pub(crate) fn add_writer(&self) {
        self.lock_state().writers += 1;
        self.ctx.writers.inc();
    }

    /// Register a writer only if no other writer is open.
    pub(crate) fn try_add_sole_writer(&self) -> bool {
        let mut state = self.lock_state();
        if state.writers > 0 {
            return false;
        }
        state.writers = 1;
        drop(state);
        self.ctx.writers.inc();
        true
    }

    /// Drop a writer. Returns `true` if it was the last one.
    pub(crate) fn remove_writer(&self) -> bool {
        let mut state = self.lock_state();
        state.writers = state.writers.saturating_sub(1);
        state.writers == 0
    }

    /// Serializes staged uploads and renames. Never held across bridge requests.
    pub(crate) fn upload_lock(&self) -> &Arc<tokio::sync::Mutex<()>> {
        &self.upload_lock
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.lock_state().streaming = streaming;
    }

    /// Open a handle. The handle type depends on the access mode and the cache mode.
    #[instrument(name = "File::open", skip(self), fields(inode = self.inode))]
    pub async fn open(self: &Arc<Self>, flags: OpenFlags) -> Result<Handle, VfsError> {
        let access = flags.access_mode().ok_or(VfsError::PermissionDenied)?;
        if (access.can_write() || flags.contains(OpenFlags::TRUNC)) && self.ctx.options.read_only {
            return Err(VfsError::ReadOnly);
        }
        let truncate = access.can_write() && flags.contains(OpenFlags::TRUNC);
        let mode = self.ctx.cache.mode();
        debug!(?access, %mode, truncate, "opening file");

        match (mode, access) {
            (CacheMode::Full, _) => {
                RwHandle::open(self, flags, access, true)
                    .await
                    .map(Handle::ReadWrite)
            }
            (CacheMode::Off | CacheMode::Minimal | CacheMode::Writes, AccessMode::ReadOnly) => {
                // Readers see changes that only exist locally so far.
                match self.ctx.cache.acquire_live(self.inode).await {
                    Some(entry) => Ok(Handle::ReadWrite(RwHandle::attach(self, flags, entry))),
                    None => Ok(Handle::Read(ReadHandle::open(self, flags))),
                }
            }
            (CacheMode::Minimal | CacheMode::Writes, AccessMode::WriteOnly | AccessMode::ReadWrite) => {
                RwHandle::open(self, flags, access, mode == CacheMode::Writes)
                    .await
                    .map(Handle::ReadWrite)
            }
            (CacheMode::Off, AccessMode::WriteOnly | AccessMode::ReadWrite)
                if truncate || self.object().is_none() =>
            {
                WriteHandle::open(self, flags).map(Handle::Write)
            }
            (CacheMode::Off, AccessMode::ReadWrite) => {
                debug!("read-write open of an existing file without O_TRUNC is read-only");
                Ok(Handle::Read(ReadHandle::open(self, flags)))
            }
            (CacheMode::Off, AccessMode::WriteOnly) => {
                debug!("cannot update an existing file without O_TRUNC in this cache mode");
                Err(VfsError::PermissionDenied)
            }
        }
    }

    /// Make `entry` hold the file's content.
    ///
    /// With `truncate` the copy is emptied instead. In full mode an idle copy that no longer
    /// matches the remote object is downloaded again, unless it holds local changes.
    pub(crate) async fn materialize(
        &self,
        entry: &StagedEntry,
        shared: bool,
        truncate: bool,
    ) -> Result<(), VfsError> {
        let mut fill = entry.lock_fill().await;
        if truncate {
            tokio::fs::File::create(entry.path()).await?;
            fill.materialized = true;
            entry.set_staged_len(0);
            drop(fill);
            self.mark_changed(0);
            return Ok(());
        }

        let object = self.object();
        if fill.materialized {
            let stale = !shared
                && self.ctx.cache.mode() == CacheMode::Full
                && !self.dirty()
                && object.as_ref().map(fingerprint) != fill.fingerprint;
            if !stale {
                return Ok(());
            }
            debug!(inode = self.inode, "remote object changed, refreshing staged copy");
        }

        let mut out = tokio::fs::File::create(entry.path()).await?;
        let mut copied = 0;
        if let Some(object) = &object {
            let mut stream = self
                .ctx
                .backend
                .open(object, ReadRange::default())
                .await?;
            copied = tokio::io::copy(&mut stream, &mut out).await?;
            out.flush().await?;
            if object.size.is_none() {
                self.learn_size(copied);
            }
            debug!(inode = self.inode, bytes = copied, "downloaded staged copy");
        }
        entry.set_staged_len(copied);
        fill.materialized = true;
        fill.fingerprint = object.as_ref().map(fingerprint);
        Ok(())
    }

    /// Upload the staged copy as the new object. The caller holds `upload_lock`.
    ///
    /// On failure the staged copy is pinned so the changes survive release.
    pub(crate) async fn upload(&self, entry: &StagedEntry) -> Result<(), VfsError> {
        let (changes, mod_time, unlinked) = {
            let state = self.lock_state();
            (
                state.changes,
                state.pending_mod_time.unwrap_or(state.mod_time),
                state.unlinked,
            )
        };
        if unlinked {
            debug!(inode = self.inode, "file was removed, skipping upload");
            return Ok(());
        }

        let path = self.path();
        let staged = tokio::fs::File::open(entry.path()).await?;
        let len = staged.metadata().await?.len();
        let result = self
            .ctx
            .backend
            .put(
                &path,
                Box::pin(staged),
                PutMeta {
                    size: Some(len),
                    mod_time,
                },
            )
            .await;
        let object = match result {
            Ok(object) => object,
            Err(e) => {
                warn!(path, error = %e, "upload failed, keeping staged copy");
                self.ctx.cache.set_pinned(self.inode, true);
                return Err(e.into());
            }
        };
        debug!(path, bytes = len, "uploaded staged copy");

        let Some(mut object) = self.settle_upload(object).await? else {
            return Ok(());
        };
        object.size = object.size.or(Some(len));
        entry.lock_fill().await.fingerprint = Some(fingerprint(&object));
        if self.commit_upload(object, changes, mod_time).await {
            self.ctx.cache.set_pinned(self.inode, false);
        }
        Ok(())
    }

    /// Adopt the object produced by an upload of `changes`. Returns whether the file is clean.
    pub(crate) async fn commit_upload(
        &self,
        object: ObjectInfo,
        changes: u64,
        uploaded_mod_time: SystemTime,
    ) -> bool {
        let (clean, late_mod_time) = {
            let mut state = self.lock_state();
            state.size = object.size.or(state.size);
            state.mod_time = object.mod_time;
            state.object = Some(object);
            state.saved = state.saved.max(changes);
            let late = state
                .pending_mod_time
                .filter(|t| *t != uploaded_mod_time && state.writers == 0);
            if state.pending_mod_time == Some(uploaded_mod_time) || state.writers == 0 {
                state.pending_mod_time = None;
            }
            (!state.dirty(), late)
        };
        if let Some(t) = late_mod_time
            && let Err(e) = self.apply_mod_time(t).await
        {
            warn!(inode = self.inode, error = %e, "could not apply modification time");
        }
        clean
    }

    /// Reconcile a finished upload with what happened to the node meanwhile.
    ///
    /// A node removed during the upload has the new object deleted and yields `None`. A node
    /// renamed during the upload has the new object moved after it.
    pub(crate) async fn settle_upload(
        &self,
        object: ObjectInfo,
    ) -> Result<Option<ObjectInfo>, VfsError> {
        if self.lock_state().unlinked {
            debug!(path = object.path, "file removed during upload, deleting new object");
            match self.ctx.backend.remove(&object.path).await {
                Ok(()) | Err(BackendError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        let path = self.path();
        if path == object.path {
            return Ok(Some(object));
        }
        debug!(from = object.path, to = path, "file renamed during upload, moving new object");
        self.move_object(&object, &path).await.map(Some)
    }

    /// Move `object` to `to` on the backend: server-side if possible, else copy then delete.
    async fn move_object(&self, object: &ObjectInfo, to: &str) -> Result<ObjectInfo, VfsError> {
        let backend = &self.ctx.backend;
        if let Some(mover) = backend.mover() {
            return Ok(mover.move_object(object, to).await?);
        }
        let copier = backend.copier().ok_or(VfsError::Unsupported)?;
        let copied = copier.copy_object(object, to).await?;
        if let Err(e) = backend.remove(&object.path).await {
            warn!(from = object.path, to, error = %e, "copied but could not delete the source");
            return Err(e.into());
        }
        Ok(copied)
    }

    /// The modification counter. Uploads snapshot it before they start.
    pub(crate) fn change_count(&self) -> u64 {
        self.lock_state().changes
    }

    /// Apply a modification time deferred while writers were open, once none are left.
    pub(crate) async fn apply_pending_mod_time(&self) {
        let pending = {
            let mut state = self.lock_state();
            if state.writers > 0 || state.object.is_none() || state.dirty() {
                return;
            }
            state.pending_mod_time.take()
        };
        if let Some(mod_time) = pending
            && let Err(e) = self.apply_mod_time(mod_time).await
        {
            warn!(inode = self.inode, error = %e, "could not apply modification time");
            self.lock_state().mod_time = mod_time;
        }
    }

    async fn apply_mod_time(&self, mod_time: SystemTime) -> Result<(), VfsError> {
        let Some(setter) = self.ctx.backend.mod_time_setter() else {
            self.lock_state().mod_time = mod_time;
            return Ok(());
        };
        let object = setter.set_mod_time(&self.path(), mod_time).await?;
        let mut state = self.lock_state();
        state.mod_time = object.mod_time;
        state.object = Some(object);
        Ok(())
    }

    /// Set the modification time.
    ///
    /// While writers are open, or before the first upload, the time is kept as pending and
    /// applied by the upload. Backends that cannot store it only keep it in memory.
    #[instrument(name = "File::set_mod_time", skip(self), fields(inode = self.inode))]
    pub async fn set_mod_time(&self, mod_time: SystemTime) -> Result<(), VfsError> {
        self.ctx.check_writable()?;
        {
            let mut state = self.lock_state();
            if state.writers > 0 || state.object.is_none() || state.dirty() {
                debug!("deferring modification time until upload");
                state.pending_mod_time = Some(mod_time);
                return Ok(());
            }
        }
        if self.ctx.backend.mod_time_setter().is_none() {
            debug!("backend cannot store modification times, keeping it locally");
        }
        self.apply_mod_time(mod_time).await
    }

    /// Delete the backing object and mark the node unlinked.
    ///
    /// Does not wait for uploads: one that finishes later deletes its own result.
    pub(crate) async fn remove_remote(&self) -> Result<(), VfsError> {
        if let Some(object) = self.object() {
            match self.ctx.backend.remove(&object.path).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.mark_unlinked();
        self.ctx.cache.forget(self.inode).await;
        Ok(())
    }

    /// Stop uploading this node, e.g. after another file was renamed over it.
    pub(crate) fn mark_unlinked(&self) {
        self.lock_state().unlinked = true;
    }

    /// Move the file to `new_name` in `new_dir`, on the backend and in the tree.
    ///
    /// Uses a server-side move if available, else copy then delete. A file that was never
    /// uploaded, or that a writer is streaming right now, only moves in the tree; its upload
    /// follows the node when it completes.
    #[instrument(name = "File::move_to", skip(self, new_dir), fields(inode = self.inode))]
    pub(crate) async fn move_to(
        self: &Arc<Self>,
        new_dir: &Arc<Dir>,
        new_name: &str,
    ) -> Result<(), VfsError> {
        let old_dir = self.dir().ok_or(VfsError::NotExist)?;
        let old_name = self.name();

        if self.lock_state().streaming {
            debug!("upload in progress, moving in the tree only");
        } else {
            let _upload = self.upload_lock.lock().await;
            if let Some(object) = self.object() {
                let new_path = join_path(&new_dir.path(), new_name);
                match self.move_object(&object, &new_path).await {
                    Ok(moved) => self.lock_state().object = Some(moved),
                    Err(e) => {
                        old_dir.flush_dir_cache();
                        new_dir.flush_dir_cache();
                        return Err(e);
                    }
                }
            } else {
                debug!("file was never uploaded, moving it in the tree only");
            }
        }

        Dir::relink(&old_dir, &old_name, new_dir, new_name, super::Node::File(Arc::clone(self)));
        Ok(())
    }
}
