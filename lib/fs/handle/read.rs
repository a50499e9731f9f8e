use std::io::SeekFrom;
use std::sync::Arc;

use tokio::io::AsyncReadExt as _;
use tracing::{debug, instrument};

use super::{HandleState, resolve_seek};
use crate::backend::{ByteStream, ReadRange};
use crate::fs::{File, OpenFlags, VfsError};

/// A backend stream and the file offset it is positioned at.
struct OpenStream {
    stream: ByteStream,
    pos: u64,
}

/// Reads streamed from the backend.
///
/// The stream is opened on the first read and reopened whenever a read does not continue where the
/// previous one stopped.
pub struct ReadHandle {
    file: Arc<File>,
    flags: OpenFlags,
    offset: u64,
    stream: Option<OpenStream>,
    state: HandleState,
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("file", &self.file)
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ReadHandle {
    pub(crate) fn open(file: &Arc<File>, flags: OpenFlags) -> Self {
        file.add_reader();
        Self {
            file: Arc::clone(file),
            flags,
            offset: 0,
            stream: None,
            state: HandleState::Idle,
        }
    }

    /// The file this handle reads.
    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub(super) async fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfsError> {
        let n = self.read_at(buf, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    #[instrument(name = "ReadHandle::read_at", skip(self, buf), fields(inode = self.file.inode(), len = buf.len()))]
    pub(super) async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError> {
        self.state.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.file.known_size().is_some_and(|size| offset >= size) {
            return Ok(0);
        }
        let Some(object) = self.file.object() else {
            return Ok(0);
        };

        let reuse = self.stream.as_ref().is_some_and(|s| s.pos == offset);
        if !reuse {
            debug!(offset, "opening backend stream");
            let stream = self
                .file
                .ctx()
                .backend
                .open(&object, ReadRange::from(offset))
                .await?;
            self.stream = Some(OpenStream {
                stream,
                pos: offset,
            });
        }
        let Some(open) = self.stream.as_mut() else {
            return Ok(0);
        };

        let (total, eof) = match fill(&mut open.stream, buf).await {
            Ok(filled) => filled,
            Err(e) => {
                // The stream position is unknown now, the next read opens a fresh one.
                self.stream = None;
                return Err(e.into());
            }
        };
        open.pos += total as u64;

        // A stream that starts past the end is empty, so only a stream that returned data, or
        // started at zero, tells where the end is.
        if eof && (total > 0 || offset == 0) {
            self.file.learn_size(open.pos);
        }
        self.state = self.state.after_read();
        Ok(total)
    }

    pub(super) fn write(&self) -> Result<usize, VfsError> {
        self.state.check_open()?;
        Err(VfsError::PermissionDenied)
    }

    pub(super) fn seek(&mut self, pos: SeekFrom) -> Result<u64, VfsError> {
        self.state.check_open()?;
        self.offset = resolve_seek(self.offset, self.file.size(), pos)?;
        Ok(self.offset)
    }

    pub(super) fn flush(&self) -> Result<(), VfsError> {
        self.state.check_open()
    }

    pub(super) fn close(&mut self) -> Result<(), VfsError> {
        self.state.check_open()?;
        self.state = HandleState::Closed;
        self.stream = None;
        self.file.remove_reader();
        Ok(())
    }

    pub(super) fn state(&self) -> HandleState {
        self.state
    }
}

/// Read until `buf` is full or the stream ends. Returns the bytes read and whether it ended.
async fn fill(stream: &mut ByteStream, buf: &mut [u8]) -> std::io::Result<(usize, bool)> {
    let mut total = 0;
    while total < buf.len() {
        let n = stream.read(&mut buf[total..]).await?;
        if n == 0 {
            return Ok((total, true));
        }
        total += n;
    }
    Ok((total, false))
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if self.state != HandleState::Closed {
            self.file.remove_reader();
        }
    }
}
