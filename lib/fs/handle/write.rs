use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncWriteExt as _, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{HandleState, resolve_seek};
use crate::backend::{BackendError, ObjectInfo, PutMeta};
use crate::fs::{File, OpenFlags, VfsError};

const PIPE_CAPACITY: usize = 64 * 1024;

/// An upload in flight: the write end of the pipe and the task feeding the read end to the backend.
struct Stream {
    pipe: DuplexStream,
    task: JoinHandle<Result<ObjectInfo, BackendError>>,
    mod_time: SystemTime,
}

/// Sequential writes streamed to the backend as one upload.
///
/// The upload starts with the first write and completes on flush or close. Writes must continue
/// exactly where the previous one stopped; the handle never reads.
pub struct WriteHandle {
    file: Arc<File>,
    flags: OpenFlags,
    offset: u64,
    stream: Option<Stream>,
    /// The upload completed on flush. Further writes would start a second, truncating upload.
    finished: bool,
    state: HandleState,
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("file", &self.file)
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .field("streaming", &self.stream.is_some())
            .field("state", &self.state)
            .finish()
    }
}

impl WriteHandle {
    /// Open for streaming. Only one streaming writer per file is allowed.
    pub(crate) fn open(file: &Arc<File>, flags: OpenFlags) -> Result<Self, VfsError> {
        if !file.try_add_sole_writer() {
            debug!(inode = file.inode(), "file already has a writer");
            return Err(VfsError::PermissionDenied);
        }
        Ok(Self {
            file: Arc::clone(file),
            flags,
            offset: 0,
            stream: None,
            finished: false,
            state: HandleState::Idle,
        })
    }

    /// The file this handle writes.
    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    fn start_upload(&mut self) -> &mut Stream {
        let (pipe, rx) = tokio::io::duplex(PIPE_CAPACITY);
        let backend = Arc::clone(&self.file.ctx().backend);
        let path = self.file.path();
        let mod_time = SystemTime::now();
        debug!(path, "starting streamed upload");
        self.file.set_streaming(true);
        let task = tokio::spawn(async move {
            backend
                .put(
                    &path,
                    Box::pin(rx),
                    PutMeta {
                        size: None,
                        mod_time,
                    },
                )
                .await
        });
        self.stream.insert(Stream {
            pipe,
            task,
            mod_time,
        })
    }

    pub(super) fn read(&self, _buf: &mut [u8]) -> Result<usize, VfsError> {
        self.state.check_open()?;
        Err(VfsError::PermissionDenied)
    }

    pub(super) async fn write(&mut self, data: &[u8]) -> Result<usize, VfsError> {
        self.write_at(data, self.offset).await
    }

    #[instrument(name = "WriteHandle::write_at", skip(self, data), fields(inode = self.file.inode(), len = data.len()))]
    pub(super) async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, VfsError> {
        self.state.check_open()?;
        if self.finished {
            debug!("write after the upload completed");
            return Err(VfsError::Closed);
        }
        if offset != self.offset {
            debug!(expected = self.offset, offset, "non-sequential write");
            return Err(VfsError::Unsupported);
        }

        let stream = match self.stream.take() {
            Some(stream) => self.stream.insert(stream),
            None => self.start_upload(),
        };
        if let Err(e) = stream.pipe.write_all(data).await {
            // The upload task is gone. Its result explains why.
            debug!(error = %e, "upload pipe closed early");
            return Err(self.abandon().await);
        }
        self.offset += data.len() as u64;
        self.file.mark_changed(self.offset);
        self.state = self.state.after_write();
        Ok(data.len())
    }

    /// Collect the error of an upload whose pipe broke.
    async fn abandon(&mut self) -> VfsError {
        self.finished = true;
        self.file.set_streaming(false);
        match self.stream.take() {
            Some(stream) => match stream.task.await {
                Ok(Err(e)) => e.into(),
                Ok(Ok(_)) | Err(_) => VfsError::UploadAborted,
            },
            None => VfsError::UploadAborted,
        }
    }

    pub(super) fn seek(&mut self, pos: SeekFrom) -> Result<u64, VfsError> {
        self.state.check_open()?;
        self.offset = resolve_seek(self.offset, self.offset, pos)?;
        Ok(self.offset)
    }

    /// Only truncation to the current offset, which is a no-op, is possible while streaming.
    pub(super) fn truncate(&self, size: u64) -> Result<(), VfsError> {
        self.state.check_open()?;
        if size == self.offset {
            Ok(())
        } else {
            Err(VfsError::Unsupported)
        }
    }

    /// Complete the upload if anything was written. Later writes fail.
    pub(super) async fn flush(&mut self) -> Result<(), VfsError> {
        self.state.check_open()?;
        if self.stream.is_some() {
            self.finish().await?;
            self.state = HandleState::Flushed;
        }
        Ok(())
    }

    /// End the stream, or store an empty object when nothing was written to a new or truncated
    /// file, and adopt the result.
    async fn finish(&mut self) -> Result<(), VfsError> {
        let changes = self.file.change_count();
        let (result, mod_time) = match self.stream.take() {
            Some(mut stream) => {
                let shutdown = stream.pipe.shutdown().await;
                drop(stream.pipe);
                let result = match stream.task.await {
                    Ok(result) => result.map_err(VfsError::from),
                    Err(e) => {
                        warn!(error = %e, "upload task failed");
                        Err(VfsError::UploadAborted)
                    }
                };
                if let (Err(e), Ok(_)) = (&shutdown, &result) {
                    warn!(error = %e, "upload pipe did not shut down cleanly");
                }
                (result, stream.mod_time)
            }
            None if !self.finished
                && (self.flags.contains(OpenFlags::TRUNC) || self.file.object().is_none()) =>
            {
                let mod_time = SystemTime::now();
                let result = self
                    .file
                    .ctx()
                    .backend
                    .put(
                        &self.file.path(),
                        Box::pin(tokio::io::empty()),
                        PutMeta {
                            size: Some(0),
                            mod_time,
                        },
                    )
                    .await
                    .map_err(VfsError::from);
                (result, mod_time)
            }
            None => return Ok(()),
        };
        self.finished = true;
        self.file.set_streaming(false);

        let mut object = result?;
        object.size = object.size.or(Some(self.offset));
        debug!(path = object.path, "streamed upload complete");
        if let Some(object) = self.file.settle_upload(object).await? {
            self.file.commit_upload(object, changes, mod_time).await;
        }
        Ok(())
    }

    pub(super) async fn close(&mut self) -> Result<(), VfsError> {
        self.state.check_open()?;
        self.state = HandleState::Closed;
        self.file.remove_writer();
        let result = self.finish().await;
        if result.is_ok() {
            self.file.apply_pending_mod_time().await;
        }
        self.file.ctx().writers.dec();
        result
    }

    pub(super) fn state(&self) -> HandleState {
        self.state
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.state == HandleState::Closed {
            return;
        }
        if let Some(stream) = self.stream.take() {
            warn!(inode = self.file.inode(), "write handle dropped without close, abandoning upload");
            stream.task.abort();
            self.file.set_streaming(false);
        }
        self.file.remove_writer();
        self.file.ctx().writers.dec();
    }
}
