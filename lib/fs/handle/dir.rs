use std::io::SeekFrom;
use std::sync::Arc;

use super::{HandleState, resolve_seek};
use crate::fs::{Dir, Node, VfsError};

/// A directory opened for listing. The listing is taken once, at open.
#[derive(Debug)]
pub struct DirHandle {
    dir: Arc<Dir>,
    entries: Vec<Node>,
    offset: u64,
    state: HandleState,
}

impl DirHandle {
    pub(crate) async fn open(dir: &Arc<Dir>) -> Result<Self, VfsError> {
        let entries = dir.read_dir_all().await?;
        Ok(Self {
            dir: Arc::clone(dir),
            entries,
            offset: 0,
            state: HandleState::Idle,
        })
    }

    /// The directory.
    #[must_use]
    pub fn dir(&self) -> &Arc<Dir> {
        &self.dir
    }

    /// The children as of open, sorted by name.
    pub fn entries(&self) -> Result<&[Node], VfsError> {
        self.state.check_open()?;
        Ok(&self.entries)
    }

    pub(super) fn read(&self) -> Result<usize, VfsError> {
        self.state.check_open()?;
        Err(VfsError::IsDir)
    }

    pub(super) fn write(&self) -> Result<usize, VfsError> {
        self.state.check_open()?;
        Err(VfsError::IsDir)
    }

    pub(super) fn seek(&mut self, pos: SeekFrom) -> Result<u64, VfsError> {
        self.state.check_open()?;
        self.offset = resolve_seek(self.offset, self.entries.len() as u64, pos)?;
        Ok(self.offset)
    }

    pub(super) fn flush(&self) -> Result<(), VfsError> {
        self.state.check_open()
    }

    pub(super) fn close(&mut self) -> Result<(), VfsError> {
        self.state.check_open()?;
        self.state = HandleState::Closed;
        Ok(())
    }

    pub(super) fn state(&self) -> HandleState {
        self.state
    }
}
