use std::io::SeekFrom;
use std::sync::Arc;

use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, instrument, warn};

use super::{HandleState, resolve_seek};
use crate::cache::staging::{Acquired, StagedEntry};
use crate::fs::{AccessMode, File, OpenFlags, VfsError};

/// Reads and writes through a staged local copy of the file.
///
/// The copy is filled on first use, unless the open truncated it. Changes are uploaded as one
/// whole object on flush, and on close by the last writer.
pub struct RwHandle {
    file: Arc<File>,
    flags: OpenFlags,
    access: AccessMode,
    /// Reads and writes may be mixed on this handle.
    allow_mixed: bool,
    entry: Arc<StagedEntry>,
    /// Another handle held the copy when this one was opened.
    shared: bool,
    fd: Option<tokio::fs::File>,
    offset: u64,
    state: HandleState,
    /// A read has succeeded on this handle. Flushing does not clear it.
    did_read: bool,
    /// A write or truncate has succeeded on this handle.
    did_write: bool,
}

impl std::fmt::Debug for RwHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwHandle")
            .field("file", &self.file)
            .field("flags", &self.flags)
            .field("access", &self.access)
            .field("offset", &self.offset)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl RwHandle {
    /// Open on a staged copy, creating it if needed.
    pub(crate) async fn open(
        file: &Arc<File>,
        flags: OpenFlags,
        access: AccessMode,
        allow_mixed: bool,
    ) -> Result<Self, VfsError> {
        let Acquired { entry, shared } = file.ctx().cache.acquire(file.inode()).await?;
        if access.can_write() {
            file.add_writer();
        } else {
            file.add_reader();
        }
        let handle = Self {
            file: Arc::clone(file),
            flags,
            access,
            allow_mixed,
            entry,
            shared,
            fd: None,
            offset: 0,
            state: HandleState::Idle,
            did_read: false,
            did_write: false,
        };
        if access.can_write() && flags.contains(OpenFlags::TRUNC) {
            // On failure the handle drops and gives back its counters.
            file.materialize(&handle.entry, shared, true).await?;
        }
        Ok(handle)
    }

    /// Read-only handle on a copy another handle already holds, so unsaved changes are visible.
    pub(crate) fn attach(file: &Arc<File>, flags: OpenFlags, entry: Arc<StagedEntry>) -> Self {
        file.add_reader();
        Self {
            file: Arc::clone(file),
            flags,
            access: AccessMode::ReadOnly,
            allow_mixed: false,
            entry,
            shared: true,
            fd: None,
            offset: 0,
            state: HandleState::Idle,
            did_read: false,
            did_write: false,
        }
    }

    /// The file this handle works on.
    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    async fn fd(&mut self) -> Result<&mut tokio::fs::File, VfsError> {
        if self.fd.is_none() {
            self.file.materialize(&self.entry, self.shared, false).await?;
            let fd = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.entry.path())
                .await?;
            self.fd = Some(fd);
        }
        self.fd.as_mut().ok_or(VfsError::Closed)
    }

    fn check_direction(&self, writing: bool) -> Result<(), VfsError> {
        self.state.check_open()?;
        let permitted = if writing {
            self.access.can_write()
        } else {
            self.access.can_read()
        };
        if !permitted {
            return Err(VfsError::PermissionDenied);
        }
        let other_done = if writing { self.did_read } else { self.did_write };
        if other_done && !self.allow_mixed {
            debug!("mixing reads and writes on one handle needs a higher cache mode");
            return Err(VfsError::PermissionDenied);
        }
        Ok(())
    }

    pub(super) async fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfsError> {
        let n = self.read_at(buf, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    pub(super) async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError> {
        self.check_direction(false)?;
        let fd = self.fd().await?;
        fd.seek(SeekFrom::Start(offset)).await?;
        let mut total = 0;
        while total < buf.len() {
            let n = fd.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        self.did_read = true;
        self.state = self.state.after_read();
        Ok(total)
    }

    pub(super) async fn write(&mut self, data: &[u8]) -> Result<usize, VfsError> {
        self.offset = self.write_bytes(data, self.offset).await?;
        Ok(data.len())
    }

    /// Positional write. The handle offset does not move.
    pub(super) async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, VfsError> {
        self.write_bytes(data, offset).await?;
        Ok(data.len())
    }

    /// Write `data` at `offset`, or at the end in append mode. Returns the offset just past it.
    #[instrument(name = "RwHandle::write", skip(self, data), fields(inode = self.file.inode(), len = data.len()))]
    async fn write_bytes(&mut self, data: &[u8], offset: u64) -> Result<u64, VfsError> {
        self.check_direction(true)?;
        let append = self.flags.contains(OpenFlags::APPEND);
        let fd = self.fd().await?;
        let start = if append {
            fd.seek(SeekFrom::End(0)).await?
        } else {
            fd.seek(SeekFrom::Start(offset)).await?
        };
        fd.write_all(data).await?;
        fd.flush().await?;
        let len = fd.metadata().await?.len();

        self.entry.set_staged_len(len);
        self.file.mark_changed(len);
        self.did_write = true;
        self.state = self.state.after_write();
        Ok(start + data.len() as u64)
    }

    pub(super) fn seek(&mut self, pos: SeekFrom) -> Result<u64, VfsError> {
        self.state.check_open()?;
        // The staged copy is authoritative once this handle has filled it.
        let size = match (&self.fd, self.entry.staged_len()) {
            (Some(_), Some(len)) => len,
            _ => self.file.size(),
        };
        self.offset = resolve_seek(self.offset, size, pos)?;
        Ok(self.offset)
    }

    pub(super) async fn truncate(&mut self, size: u64) -> Result<(), VfsError> {
        self.check_direction(true)?;
        if size == 0 && self.fd.is_none() {
            self.file.materialize(&self.entry, self.shared, true).await?;
        } else {
            let fd = self.fd().await?;
            fd.set_len(size).await?;
            self.entry.set_staged_len(size);
            self.file.mark_changed(size);
        }
        self.did_write = true;
        self.state = self.state.after_write();
        Ok(())
    }

    /// Upload the copy if it holds changes the backend has not accepted yet.
    async fn upload_if_dirty(&mut self) -> Result<(), VfsError> {
        if let Some(fd) = self.fd.as_mut() {
            fd.flush().await?;
        }
        let upload_lock = Arc::clone(self.file.upload_lock());
        let _upload = upload_lock.lock().await;
        if self.file.dirty() {
            self.file.upload(&self.entry).await?;
        }
        Ok(())
    }

    pub(super) async fn flush(&mut self) -> Result<(), VfsError> {
        self.state.check_open()?;
        // Writers that never wrote leave the upload to close.
        if self.access.can_write() && self.did_write {
            self.upload_if_dirty().await?;
            self.state = HandleState::Flushed;
        }
        Ok(())
    }

    pub(super) async fn close(&mut self) -> Result<(), VfsError> {
        self.state.check_open()?;
        self.state = HandleState::Closed;
        let mut result = Ok(());
        if let Some(mut fd) = self.fd.take()
            && let Err(e) = fd.flush().await
        {
            result = Err(e.into());
        }

        if self.access.can_write() {
            let upload_lock = Arc::clone(self.file.upload_lock());
            let upload = upload_lock.lock().await;
            let last = self.file.remove_writer();
            if result.is_ok() && last && (self.file.dirty() || self.file.object().is_none()) {
                result = self.final_upload().await;
            }
            drop(upload);
            if result.is_ok() && last {
                self.file.apply_pending_mod_time().await;
            }
            if result.is_err() && self.file.dirty() {
                self.file.ctx().cache.set_pinned(self.file.inode(), true);
            }
            self.file.ctx().cache.release(&self.entry);
            self.file.ctx().writers.dec();
        } else {
            self.file.remove_reader();
            self.file.ctx().cache.release(&self.entry);
        }
        result
    }

    async fn final_upload(&self) -> Result<(), VfsError> {
        // A file created and closed without writes is uploaded empty.
        self.file.materialize(&self.entry, self.shared, false).await?;
        self.file.upload(&self.entry).await
    }

    pub(super) fn state(&self) -> HandleState {
        self.state
    }
}

impl Drop for RwHandle {
    fn drop(&mut self) {
        if self.state == HandleState::Closed {
            return;
        }
        let ctx = self.file.ctx();
        if self.access.can_write() {
            self.file.remove_writer();
            if self.file.dirty() {
                warn!(inode = self.file.inode(), "handle dropped with changes that were never uploaded");
                ctx.cache.set_pinned(self.file.inode(), true);
            }
            ctx.cache.release(&self.entry);
            ctx.writers.dec();
        } else {
            self.file.remove_reader();
            ctx.cache.release(&self.entry);
        }
    }
}
