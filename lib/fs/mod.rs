//! The virtual filesystem core: node tree, directory cache, file handles and the façade.

/// Per-directory listing cache.
pub mod dcache;
/// Directory nodes.
pub mod dir;
/// Error kinds and their errno mapping.
pub mod error;
/// File nodes.
pub mod file;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`vfs::Vfs`].
pub mod fuser;
/// Open file and directory handles.
pub mod handle;
/// The polymorphic node type.
pub mod node;
/// Construction-time options.
pub mod options;
/// The façade used by bridges.
pub mod vfs;

pub use dir::Dir;
pub use error::VfsError;
pub use file::File;
pub use handle::{Handle, HandleState};
pub use node::Node;
pub use options::VfsOptions;
pub use vfs::Vfs;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bitflags::bitflags;

/// Type representing an inode number.
pub type Inode = u64;

/// Type representing a file handle issued by a bridge.
pub type FileHandle = u64;

/// The root directory's inode number, matching the kernel's `FUSE_ROOT_ID`.
pub const ROOT_INODE: Inode = 1;

static NEXT_INODE: AtomicU64 = AtomicU64::new(ROOT_INODE + 1);

/// Allocate a process-unique inode number for a non-root node.
pub(crate) fn next_inode() -> Inode {
    NEXT_INODE.fetch_add(1, Ordering::Relaxed)
}

bitflags! {
    /// Permission bits for a node, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;

        /// Other: read, write, and execute.
        const OTHER_RWX = Self::OTHER_READ.bits()
            | Self::OTHER_WRITE.bits()
            | Self::OTHER_EXECUTE.bits();
        /// Group: read, write, and execute.
        const GROUP_RWX = Self::GROUP_READ.bits()
            | Self::GROUP_WRITE.bits()
            | Self::GROUP_EXECUTE.bits();
        /// Owner: read, write, and execute.
        const OWNER_RWX = Self::OWNER_READ.bits()
            | Self::OWNER_WRITE.bits()
            | Self::OWNER_EXECUTE.bits();
    }
}

impl InodePerms {
    /// Build from the low twelve bits of a numeric mode, e.g. `0o755`.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "masked to 12 bits first")]
        Self::from_bits_truncate((mode & 0o7777) as u16)
    }

    /// Clear every bit set in `umask`.
    #[must_use]
    pub fn masked(self, umask: u16) -> Self {
        self.difference(Self::from_bits_truncate(umask))
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Synchronous data integrity writes.
        const DSYNC = libc::O_DSYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Set close-on-exec.
        const CLOEXEC = libc::O_CLOEXEC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;

        /// Do not update access time (Linux only).
        #[cfg(target_os = "linux")]
        const NOATIME = libc::O_NOATIME;

        // Keep any other kernel-supplied bits, such as an invalid access mode.
        const _ = !0;
    }
}

/// The access mode encoded in the low bits of [`OpenFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// `O_RDONLY`.
    ReadOnly,
    /// `O_WRONLY`.
    WriteOnly,
    /// `O_RDWR`.
    ReadWrite,
}

impl AccessMode {
    /// Whether reads are permitted.
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Whether writes are permitted.
    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

impl OpenFlags {
    /// Decode the access mode. `None` for the invalid mode `3`.
    #[must_use]
    pub fn access_mode(self) -> Option<AccessMode> {
        match self.bits() & libc::O_ACCMODE {
            libc::O_RDONLY => Some(AccessMode::ReadOnly),
            libc::O_WRONLY => Some(AccessMode::WriteOnly),
            libc::O_RDWR => Some(AccessMode::ReadWrite),
            _ => None,
        }
    }
}

/// The type of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// A snapshot of a node's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attr {
    /// The inode number of the node.
    pub inode: Inode,
    /// File or directory.
    pub kind: NodeKind,
    /// Size in bytes. Zero for directories and for files of unknown size.
    pub size: u64,
    /// Permission bits after applying the umask.
    pub perms: InodePerms,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Last modification time.
    pub mod_time: SystemTime,
}

/// Storage usage reported by [`Vfs::statfs`]. `-1` marks quantities the backend cannot report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsUsage {
    /// Total capacity in bytes.
    pub total: i64,
    /// Bytes in use.
    pub used: i64,
    /// Bytes free.
    pub free: i64,
}

impl FsUsage {
    /// Every quantity unknown.
    pub const UNKNOWN: Self = Self {
        total: -1,
        used: -1,
        free: -1,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umask_clears_bits() {
        assert_eq!(
            InodePerms::from_mode(0o777).masked(0o002),
            InodePerms::from_mode(0o775)
        );
        assert_eq!(
            InodePerms::from_mode(0o666).masked(0o022),
            InodePerms::from_mode(0o644)
        );
    }

    #[test]
    fn access_mode_rejects_invalid_combination() {
        assert_eq!(
            OpenFlags::from_bits_retain(libc::O_RDONLY).access_mode(),
            Some(AccessMode::ReadOnly)
        );
        assert_eq!(
            (OpenFlags::RDWR | OpenFlags::CREAT).access_mode(),
            Some(AccessMode::ReadWrite)
        );
        assert_eq!(OpenFlags::from_bits_retain(3).access_mode(), None);
    }
}
