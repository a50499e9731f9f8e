use std::sync::Arc;

use super::{Attr, Dir, File, Inode, NodeKind};

/// A file or directory in the tree.
///
/// Cloning is cheap and yields another reference to the same node.
#[derive(Debug, Clone)]
pub enum Node {
    /// A regular file.
    File(Arc<File>),
    /// A directory.
    Dir(Arc<Dir>),
}

impl Node {
    /// The node's inode number, stable for the node's lifetime.
    #[must_use]
    pub fn inode(&self) -> Inode {
        match self {
            Self::File(f) => f.inode(),
            Self::Dir(d) => d.inode(),
        }
    }

    /// The leaf name. Empty for the root.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::File(f) => f.name(),
            Self::Dir(d) => d.name(),
        }
    }

    /// The slash separated path from the root, rebuilt from the parent chain.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::File(f) => f.path(),
            Self::Dir(d) => d.path(),
        }
    }

    /// File or directory.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::File(_) => NodeKind::File,
            Self::Dir(_) => NodeKind::Directory,
        }
    }

    /// Whether this is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    /// A snapshot of the node's attributes.
    #[must_use]
    pub fn attr(&self) -> Attr {
        match self {
            Self::File(f) => f.attr(),
            Self::Dir(d) => d.attr(),
        }
    }

    /// The file, if this is one.
    #[must_use]
    pub fn as_file(&self) -> Option<&Arc<File>> {
        match self {
            Self::File(f) => Some(f),
            Self::Dir(_) => None,
        }
    }

    /// The directory, if this is one.
    #[must_use]
    pub fn as_dir(&self) -> Option<&Arc<Dir>> {
        match self {
            Self::Dir(d) => Some(d),
            Self::File(_) => None,
        }
    }

    /// Whether both values refer to the same node object.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::File(a), Self::File(b)) => Arc::ptr_eq(a, b),
            (Self::Dir(a), Self::Dir(b)) => Arc::ptr_eq(a, b),
            (Self::File(_), Self::Dir(_)) | (Self::Dir(_), Self::File(_)) => false,
        }
    }
}
