//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`Vfs`].

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;
use tracing::{debug, instrument, warn};

use super::{
    Attr, Dir, FileHandle, FsUsage, Handle, Inode, Node, NodeKind, OpenFlags, ROOT_INODE, Vfs,
    VfsError,
};
use crate::drop_ward::{DropWard, StatelessDrop};

/// Extended attribute holding the storage tier of a file.
const XATTR_TIER: &str = "user.tier";
/// Extended attribute holding a public link to a file.
const XATTR_PUBLIC_LINK: &str = "user.public-link";

const BLOCK_SIZE: u32 = 4096;
const MAX_NAME_LEN: u32 = 255;
/// Object stores have no inode table; report a generous fixed count.
const MAX_FILES: u64 = 1_000_000_000;

/// Blocks reported when the backend cannot tell its capacity: one pebibyte.
const UNKNOWN_BLOCKS: u64 = (1 << 50) / BLOCK_SIZE as u64;

/// How long the kernel may cache attributes and entries. Listings change behind our back, so
/// this stays short.
const TTL: Duration = Duration::from_secs(1);

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyCreate,
    fuser::ReplyWrite,
    fuser::ReplyXattr,
);

/// Extension trait on `Result<T, VfsError>` for FUSE reply handling.
///
/// Each callback only expresses its success path; errors are logged and turned into errno.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, VfsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(i32::from(e));
            }
        }
    }
}

/// Nodes the kernel holds references to, by inode.
type NodeTable = scc::HashMap<Inode, Node>;

/// Drops a node from the table once the kernel forgot every lookup of it.
struct ForgetNode;

impl StatelessDrop<NodeTable, Inode> for ForgetNode {
    fn delete(table: &NodeTable, inode: &Inode) {
        table.remove_sync(inode);
    }
}

fn to_fuser_kind(kind: NodeKind) -> fuser::FileType {
    match kind {
        NodeKind::File => fuser::FileType::RegularFile,
        NodeKind::Directory => fuser::FileType::Directory,
    }
}

fn to_fuser_attr(attr: &Attr) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: attr.inode,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.mod_time,
        mtime: attr.mod_time,
        ctime: attr.mod_time,
        crtime: attr.mod_time,
        kind: to_fuser_kind(attr.kind),
        perm: attr.perms.bits(),
        nlink: match attr.kind {
            NodeKind::File => 1,
            NodeKind::Directory => 2,
        },
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn blocks(bytes: i64) -> Option<u64> {
    u64::try_from(bytes).ok().map(|b| b / u64::from(BLOCK_SIZE))
}

fn name_str(name: &OsStr) -> Result<&str, VfsError> {
    name.to_str().ok_or(VfsError::InvalidArgument)
}

/// Answer an xattr request: the size when the kernel asks with `size == 0`, else the data.
fn reply_xattr(reply: fuser::ReplyXattr, value: &[u8], size: u32) {
    let Ok(len) = u32::try_from(value.len()) else {
        reply.error(libc::E2BIG);
        return;
    };
    if size == 0 {
        reply.size(len);
    } else if len > size {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}

/// Bridges a [`Vfs`] to the [`fuser::Filesystem`] trait.
///
/// Keeps the nodes the kernel has looked up, counted by a [`DropWard`], and the open handles by
/// file handle number. Every callback blocks on the runtime.
pub struct FuserAdapter {
    vfs: Arc<Vfs>,
    ward: DropWard<NodeTable, Inode, ForgetNode>,
    handles: FxHashMap<FileHandle, Handle>,
    next_fh: FileHandle,
    runtime: tokio::runtime::Handle,
}

impl FuserAdapter {
    /// Create an adapter serving `vfs`.
    #[must_use]
    pub fn new(vfs: Arc<Vfs>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            vfs,
            ward: DropWard::new(NodeTable::new()),
            handles: FxHashMap::default(),
            next_fh: 1,
            runtime,
        }
    }

    fn node(&self, ino: Inode) -> Result<Node, VfsError> {
        if ino == ROOT_INODE {
            return Ok(Node::Dir(Arc::clone(self.vfs.root())));
        }
        self.ward
            .ctx()
            .read_sync(&ino, |_, node| node.clone())
            .ok_or(VfsError::NotExist)
    }

    fn dir(&self, ino: Inode) -> Result<Arc<Dir>, VfsError> {
        match self.node(ino)? {
            Node::Dir(dir) => Ok(dir),
            Node::File(_) => Err(VfsError::NotDir),
        }
    }

    /// Record a lookup reference the kernel now holds on `node`.
    fn remember(&mut self, node: &Node) {
        let ino = node.inode();
        if ino == ROOT_INODE {
            return;
        }
        self.ward.ctx().entry_sync(ino).or_insert_with(|| node.clone());
        self.ward.inc(ino);
    }

    /// Give back `nlookup` of the kernel's references on `ino`. The node is dropped at zero.
    fn forget_lookups(&mut self, ino: Inode, nlookup: usize) {
        if self.ward.dec_count(&ino, nlookup) == Some(0) {
            debug!(ino, "kernel forgot node");
        }
    }

    fn insert_handle(&mut self, handle: Handle) -> FileHandle {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }

    fn handle_mut(&mut self, fh: FileHandle) -> Result<&mut Handle, VfsError> {
        self.handles.get_mut(&fh).ok_or(VfsError::Closed)
    }

    fn xattr_value(&self, ino: Inode, name: &str) -> Result<Option<String>, VfsError> {
        let path = self.node(ino)?.path();
        self.runtime.block_on(async {
            match name {
                XATTR_TIER => self.vfs.tier(&path).await.map(Some),
                XATTR_PUBLIC_LINK => self.vfs.public_link(&path).await.map(Some),
                _ => Ok(None),
            }
        })
    }
}

impl fuser::Filesystem for FuserAdapter {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let result = self.dir(parent).and_then(|dir| {
            let name = name_str(name)?;
            self.runtime.block_on(dir.stat(name))
        });
        if let Ok(node) = &result {
            self.remember(node);
        }
        result.fuse_reply(reply, |node, reply| {
            reply.entry(&TTL, &to_fuser_attr(&node.attr()), 0);
        });
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "nlookup fits in usize on supported 64-bit platforms"
    )]
    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.forget_lookups(ino, nlookup as usize);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.node(ino).fuse_reply(reply, |node, reply| {
            reply.attr(&TTL, &to_fuser_attr(&node.attr()));
        });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, _req, _mode, _uid, _gid, _atime, _ctime, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let result = self.node(ino).and_then(|node| {
            if let Some(size) = size {
                match fh.and_then(|fh| self.handles.get_mut(&fh)) {
                    Some(handle) => self.runtime.block_on(handle.truncate(size))?,
                    None => self.runtime.block_on(self.vfs.truncate_node(&node, size))?,
                }
            }
            if let Some(mtime) = mtime {
                let mod_time = match mtime {
                    fuser::TimeOrNow::SpecificTime(t) => t,
                    fuser::TimeOrNow::Now => SystemTime::now(),
                };
                if let Node::File(file) = &node {
                    self.runtime.block_on(file.set_mod_time(mod_time))?;
                }
            }
            Ok(node)
        });
        result.fuse_reply(reply, |node, reply| {
            reply.attr(&TTL, &to_fuser_attr(&node.attr()));
        });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, _mode, _umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let result = self.dir(parent).and_then(|dir| {
            let name = name_str(name)?;
            self.runtime.block_on(dir.mkdir(name)).map(Node::Dir)
        });
        if let Ok(node) = &result {
            self.remember(node);
        }
        result.fuse_reply(reply, |node, reply| {
            reply.entry(&TTL, &to_fuser_attr(&node.attr()), 0);
        });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.dir(parent)
            .and_then(|dir| {
                let name = name_str(name)?;
                self.runtime.block_on(async {
                    if dir.stat(name).await?.is_dir() {
                        return Err(VfsError::IsDir);
                    }
                    dir.remove(name).await
                })
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.dir(parent)
            .and_then(|dir| {
                let name = name_str(name)?;
                self.runtime.block_on(async {
                    if !dir.stat(name).await?.is_dir() {
                        return Err(VfsError::NotDir);
                    }
                    dir.remove(name).await
                })
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, _req, reply))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let result = (|| {
            if flags & !libc::RENAME_NOREPLACE != 0 {
                return Err(VfsError::InvalidArgument);
            }
            let old_dir = self.dir(parent)?;
            let new_dir = self.dir(newparent)?;
            let (name, newname) = (name_str(name)?, name_str(newname)?);
            self.runtime.block_on(async {
                if flags & libc::RENAME_NOREPLACE != 0 && new_dir.stat(newname).await.is_ok() {
                    return Err(VfsError::AlreadyExists);
                }
                self.vfs.rename_in(&old_dir, name, &new_dir, newname).await
            })
        })();
        result.fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_retain(flags);
        let result = self
            .node(ino)
            .and_then(|node| self.runtime.block_on(self.vfs.open_node(&node, flags)))
            .map(|handle| self.insert_handle(handle));
        result.fuse_reply(reply, |fh, reply| {
            debug!(handle = fh, "replying...");
            reply.opened(fh, 0);
        });
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, _mode, _umask, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let flags = OpenFlags::from_bits_retain(flags) | OpenFlags::CREAT;
        let result = self.dir(parent).and_then(|dir| {
            let name = name_str(name)?;
            self.runtime.block_on(self.vfs.create_in(&dir, name, flags))
        });
        let result = result.map(|handle| {
            let node = handle.node();
            self.remember(&node);
            (node.attr(), self.insert_handle(handle))
        });
        result.fuse_reply(reply, |(attr, fh), reply| {
            reply.created(&TTL, &to_fuser_attr(&attr), 0, fh, 0);
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let runtime = self.runtime.clone();
        let result = u64::try_from(offset)
            .map_err(|_| VfsError::InvalidArgument)
            .and_then(|offset| {
                let handle = self.handle_mut(fh)?;
                let mut buf = vec![0; size as usize];
                let n = runtime.block_on(handle.read_at(&mut buf, offset))?;
                buf.truncate(n);
                Ok(buf)
            });
        result.fuse_reply(reply, |data, reply| {
            debug!(read_bytes = data.len(), "replying...");
            reply.data(&data);
        });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, data, _write_flags, _flags, _lock_owner, reply),
        fields(len = data.len())
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let runtime = self.runtime.clone();
        let result = u64::try_from(offset)
            .map_err(|_| VfsError::InvalidArgument)
            .and_then(|offset| {
                let handle = self.handle_mut(fh)?;
                let n = runtime.block_on(handle.write_at(data, offset))?;
                u32::try_from(n).map_err(|_| VfsError::InvalidArgument)
            });
        result.fuse_reply(reply, |n, reply| reply.written(n));
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        self.handle_mut(fh)
            .and_then(|handle| runtime.block_on(handle.flush()))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, _datasync, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        self.handle_mut(fh)
            .and_then(|handle| runtime.block_on(handle.sync()))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        match self.handles.remove(&fh) {
            Some(mut handle) => self
                .runtime
                .block_on(handle.close())
                .fuse_reply(reply, |(), reply| reply.ok()),
            None => {
                debug!("file handle not open, replying error");
                reply.error(libc::EBADF);
            }
        }
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, _flags, reply))]
    fn opendir(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let result = self
            .dir(ino)
            .and_then(|dir| {
                self.runtime
                    .block_on(self.vfs.open_node(&Node::Dir(dir), OpenFlags::RDONLY))
            })
            .map(|handle| self.insert_handle(handle));
        result.fuse_reply(reply, |fh, reply| reply.opened(fh, 0));
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let entries = match self.handles.get(&fh) {
            Some(Handle::Dir(handle)) => handle.entries().map(|children| {
                let dir = handle.dir();
                let parent = dir.parent().map_or(ROOT_INODE, |p| p.inode());
                let mut entries = Vec::with_capacity(children.len() + 2);
                entries.push((dir.inode(), fuser::FileType::Directory, ".".to_owned()));
                entries.push((parent, fuser::FileType::Directory, "..".to_owned()));
                entries.extend(
                    children
                        .iter()
                        .map(|child| (child.inode(), to_fuser_kind(child.kind()), child.name())),
                );
                entries
            }),
            Some(_) => Err(VfsError::NotDir),
            None => Err(VfsError::Closed),
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                debug!(ino, error = %e, "replying error");
                reply.error(i32::from(e));
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
            let Ok(next) = i64::try_from(i + 1) else {
                break;
            };
            if reply.add(*entry_ino, next, *kind, name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _ino, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        match self.handles.remove(&fh) {
            Some(mut handle) => self
                .runtime
                .block_on(handle.close())
                .fuse_reply(reply, |(), reply| reply.ok()),
            None => reply.error(libc::EBADF),
        }
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let usage: FsUsage = self.runtime.block_on(self.vfs.statfs());
        let total = blocks(usage.total).unwrap_or(UNKNOWN_BLOCKS);
        let free = blocks(usage.free)
            .or_else(|| blocks(usage.used).map(|used| total.saturating_sub(used)))
            .unwrap_or(UNKNOWN_BLOCKS);
        debug!(?usage, "replying...");
        reply.statfs(
            total,
            free,
            free,
            MAX_FILES,
            MAX_FILES,
            BLOCK_SIZE,
            MAX_NAME_LEN,
            BLOCK_SIZE,
        );
    }

    #[instrument(name = "FuserAdapter::getxattr", skip(self, _req, reply))]
    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let value = name_str(name).and_then(|name| self.xattr_value(ino, name));
        match value {
            Ok(Some(value)) => reply_xattr(reply, value.as_bytes(), size),
            Ok(None) | Err(VfsError::Unsupported | VfsError::IsDir) => reply.error(libc::ENODATA),
            Err(e) => {
                warn!(ino, error = %e, "could not read extended attribute");
                reply.error(i32::from(e));
            }
        }
    }

    #[instrument(name = "FuserAdapter::listxattr", skip(self, _req, reply))]
    fn listxattr(&mut self, _req: &fuser::Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(e) => {
                reply.error(i32::from(e));
                return;
            }
        };
        let features = self.vfs.features();
        let mut names = Vec::new();
        if !node.is_dir() {
            if features.tiering {
                names.extend_from_slice(XATTR_TIER.as_bytes());
                names.push(0);
            }
            if features.public_link {
                names.extend_from_slice(XATTR_PUBLIC_LINK.as_bytes());
                names.push(0);
            }
        }
        reply_xattr(reply, &names, size);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::fs::InodePerms;

    fn attr(kind: NodeKind, size: u64) -> Attr {
        Attr {
            inode: 42,
            kind,
            size,
            perms: InodePerms::from_mode(0o644),
            uid: 1000,
            gid: 100,
            mod_time: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn file_attr_counts_512_byte_blocks() {
        let fa = to_fuser_attr(&attr(NodeKind::File, 1025));
        assert_eq!(fa.blocks, 3);
        assert_eq!(fa.nlink, 1);
        assert_eq!(fa.perm, 0o644);
        assert_eq!(fa.kind, fuser::FileType::RegularFile);
        assert_eq!(fa.blksize, BLOCK_SIZE);
    }

    #[test]
    fn directories_have_two_links() {
        let fa = to_fuser_attr(&attr(NodeKind::Directory, 0));
        assert_eq!(fa.nlink, 2);
        assert_eq!(fa.kind, fuser::FileType::Directory);
    }

    #[test]
    fn unknown_usage_has_no_block_count() {
        assert_eq!(blocks(-1), None);
        assert_eq!(blocks(8192), Some(2));
        assert_eq!(blocks(4095), Some(0));
    }

    fn adapter(cache_dir: &tempfile::TempDir) -> FuserAdapter {
        let options = crate::fs::VfsOptions {
            cache_dir: cache_dir.path().join("staging"),
            cache_poll_interval: Duration::ZERO,
            ..crate::fs::VfsOptions::default()
        };
        let backend = Arc::new(crate::backend::MemoryBackend::new());
        FuserAdapter::new(
            Arc::new(Vfs::new(backend, options)),
            tokio::runtime::Handle::current(),
        )
    }

    #[tokio::test]
    async fn node_lives_until_every_lookup_is_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = adapter(&dir);
        let sub = Node::Dir(fs.vfs.mkdir("sub").await.unwrap());
        let ino = sub.inode();
        assert!(matches!(fs.node(ino), Err(VfsError::NotExist)));

        fs.remember(&sub);
        fs.remember(&sub);
        assert_eq!(fs.ward.count(&ino), 2);

        fs.forget_lookups(ino, 1);
        assert_eq!(fs.node(ino).unwrap().inode(), ino);
        fs.forget_lookups(ino, 1);
        assert!(matches!(fs.node(ino), Err(VfsError::NotExist)));
        assert_eq!(fs.ward.count(&ino), 0);
    }

    #[tokio::test]
    async fn batched_forget_drops_the_node_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = adapter(&dir);
        let sub = Node::Dir(fs.vfs.mkdir("sub").await.unwrap());
        for _ in 0..3 {
            fs.remember(&sub);
        }

        fs.forget_lookups(sub.inode(), 5);
        assert!(matches!(fs.dir(sub.inode()), Err(VfsError::NotExist)));
        // Forgetting an inode that is no longer tracked is harmless.
        fs.forget_lookups(sub.inode(), 1);
    }

    #[tokio::test]
    async fn root_is_never_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = adapter(&dir);
        let root = Node::Dir(Arc::clone(fs.vfs.root()));

        fs.remember(&root);
        assert_eq!(fs.ward.count(&ROOT_INODE), 0);
        fs.forget_lookups(ROOT_INODE, 1);
        assert!(fs.dir(ROOT_INODE).is_ok());
    }

    #[test]
    fn names_must_be_utf8() {
        use std::os::unix::ffi::OsStrExt as _;

        assert!(name_str(OsStr::new("plain")).is_ok());
        assert!(name_str(OsStr::from_bytes(b"\xff\xfe")).is_err());
    }
}
