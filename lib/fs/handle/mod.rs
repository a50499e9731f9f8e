//! Open file and directory handles.
//!
//! [`crate::fs::File::open`] picks the handle type from the access mode and the cache mode:
//!
//! - [`ReadHandle`] streams straight from the backend.
//! - [`WriteHandle`] streams a sequential upload straight to the backend.
//! - [`RwHandle`] works on a staged local copy that is uploaded whole on flush and close.
//! - [`DirHandle`] holds a directory listing snapshot.

mod dir;
mod read;
mod rw;
mod write;

pub use dir::DirHandle;
pub use read::ReadHandle;
pub use rw::RwHandle;
pub use write::WriteHandle;

use std::io::SeekFrom;

use super::{Node, VfsError};

/// Where a handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// Opened, no I/O yet.
    Idle,
    /// At least one read.
    Reading,
    /// At least one write.
    Writing,
    /// Both reads and writes.
    ReadingAndWriting,
    /// The last operation was a successful flush.
    Flushed,
    /// Closed. Every further operation fails.
    Closed,
}

impl HandleState {
    fn after_read(self) -> Self {
        match self {
            Self::Idle | Self::Flushed | Self::Reading => Self::Reading,
            Self::Writing | Self::ReadingAndWriting => Self::ReadingAndWriting,
            Self::Closed => Self::Closed,
        }
    }

    fn after_write(self) -> Self {
        match self {
            Self::Idle | Self::Flushed | Self::Writing => Self::Writing,
            Self::Reading | Self::ReadingAndWriting => Self::ReadingAndWriting,
            Self::Closed => Self::Closed,
        }
    }

    fn check_open(self) -> Result<(), VfsError> {
        if self == Self::Closed {
            Err(VfsError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Resolve a seek against the current offset and the size.
fn resolve_seek(current: u64, size: u64, pos: SeekFrom) -> Result<u64, VfsError> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => size.checked_add_signed(delta),
    };
    target.ok_or(VfsError::InvalidArgument)
}

/// An open file or directory.
#[derive(Debug)]
pub enum Handle {
    /// Streaming reads.
    Read(ReadHandle),
    /// Streaming sequential writes.
    Write(WriteHandle),
    /// Reads and writes through a staged copy.
    ReadWrite(RwHandle),
    /// A directory listing.
    Dir(DirHandle),
}

impl Handle {
    /// Read at the current offset, advancing it. Returns 0 at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfsError> {
        match self {
            Self::Read(h) => h.read(buf).await,
            Self::Write(h) => h.read(buf),
            Self::ReadWrite(h) => h.read(buf).await,
            Self::Dir(h) => h.read(),
        }
    }

    /// Read at `offset` without moving the current offset. Returns 0 at end of file.
    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, VfsError> {
        match self {
            Self::Read(h) => h.read_at(buf, offset).await,
            Self::Write(h) => h.read(buf),
            Self::ReadWrite(h) => h.read_at(buf, offset).await,
            Self::Dir(h) => h.read(),
        }
    }

    /// Write at the current offset, advancing it.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, VfsError> {
        match self {
            Self::Read(h) => h.write(),
            Self::Write(h) => h.write(data).await,
            Self::ReadWrite(h) => h.write(data).await,
            Self::Dir(h) => h.write(),
        }
    }

    /// Write at `offset`. Gaps past the end read back as zeros.
    pub async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, VfsError> {
        match self {
            Self::Read(h) => h.write(),
            Self::Write(h) => h.write_at(data, offset).await,
            Self::ReadWrite(h) => h.write_at(data, offset).await,
            Self::Dir(h) => h.write(),
        }
    }

    /// Move the current offset. Never touches the backend.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, VfsError> {
        match self {
            Self::Read(h) => h.seek(pos),
            Self::Write(h) => h.seek(pos),
            Self::ReadWrite(h) => h.seek(pos),
            Self::Dir(h) => h.seek(pos),
        }
    }

    /// Change the file's length.
    pub async fn truncate(&mut self, size: u64) -> Result<(), VfsError> {
        match self {
            Self::Read(h) => h.write().map(drop),
            Self::Write(h) => h.truncate(size),
            Self::ReadWrite(h) => h.truncate(size).await,
            Self::Dir(h) => h.write().map(drop),
        }
    }

    /// Upload pending changes. The handle stays open.
    pub async fn flush(&mut self) -> Result<(), VfsError> {
        match self {
            Self::Read(h) => h.flush(),
            Self::Write(h) => h.flush().await,
            Self::ReadWrite(h) => h.flush().await,
            Self::Dir(h) => h.flush(),
        }
    }

    /// Same as [`Self::flush`].
    pub async fn sync(&mut self) -> Result<(), VfsError> {
        self.flush().await
    }

    /// Flush and release. A second close fails with [`VfsError::Closed`].
    pub async fn close(&mut self) -> Result<(), VfsError> {
        match self {
            Self::Read(h) => h.close(),
            Self::Write(h) => h.close().await,
            Self::ReadWrite(h) => h.close().await,
            Self::Dir(h) => h.close(),
        }
    }

    /// The handle's lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandleState {
        match self {
            Self::Read(h) => h.state(),
            Self::Write(h) => h.state(),
            Self::ReadWrite(h) => h.state(),
            Self::Dir(h) => h.state(),
        }
    }

    /// The node this handle was opened on.
    #[must_use]
    pub fn node(&self) -> Node {
        match self {
            Self::Read(h) => Node::File(h.file().clone()),
            Self::Write(h) => Node::File(h.file().clone()),
            Self::ReadWrite(h) => Node::File(h.file().clone()),
            Self::Dir(h) => Node::Dir(h.dir().clone()),
        }
    }
}
