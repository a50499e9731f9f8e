//! A backend that keeps every object in process memory.
//!
//! Directories are partly implicit, as in most object stores: any prefix of a stored object is a
//! directory, and [`Backend::mkdir`] records empty ones explicitly.
//!
//! The store can be shaped for tests: every optional capability can be switched off, object sizes
//! can be hidden from listings, calls can be made to fail, and GET/PUT requests are counted.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt as _, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::{
    About, Backend, BackendError, ByteStream, ChangeEvent, ChangeNotifier, Copier, DirInfo,
    DirMover, Entry, ModTimeSetter, Mover, ObjectInfo, PublicLinker, PutMeta, ReadRange, Tiering,
    Usage, join_path, parent_path,
};

const DEFAULT_TIER: &str = "standard";

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mod_time: SystemTime,
    tier: String,
}

impl StoredObject {
    fn info(&self, path: &str) -> ObjectInfo {
        ObjectInfo {
            path: path.to_owned(),
            size: Some(self.data.len() as u64),
            mod_time: self.mod_time,
            hash: None,
        }
    }
}

bitflags! {
    /// The optional capabilities a [`MemoryBackend`] advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// [`Mover`].
        const MOVE = 1 << 0;
        /// [`Copier`].
        const COPY = 1 << 1;
        /// [`DirMover`].
        const DIR_MOVE = 1 << 2;
        /// [`About`].
        const ABOUT = 1 << 3;
        /// [`ModTimeSetter`].
        const SET_MOD_TIME = 1 << 4;
        /// [`ChangeNotifier`].
        const CHANGE_NOTIFY = 1 << 5;
        /// [`PublicLinker`].
        const PUBLIC_LINK = 1 << 6;
        /// [`Tiering`].
        const TIERING = 1 << 7;
    }
}

/// Calls that can be made to fail with [`MemoryBackend::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// [`Backend::list`].
    List,
    /// [`Backend::open`].
    Open,
    /// [`Backend::put`].
    Put,
    /// [`Backend::remove`].
    Remove,
    /// [`Copier::copy_object`].
    Copy,
    /// [`Mover::move_object`].
    Move,
    /// [`About::about`].
    About,
}

#[derive(Debug, Default)]
struct Store {
    objects: BTreeMap<String, StoredObject>,
    /// Explicitly created directories. Prefixes of object paths are directories as well.
    dirs: BTreeSet<String>,
}

impl Store {
    fn dir_exists(&self, dir: &str) -> bool {
        if dir.is_empty() || self.dirs.contains(dir) {
            return true;
        }
        let prefix = format!("{dir}/");
        self.objects.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{dir}/");
        self.objects.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    fn add_dir_chain(&mut self, dir: &str) {
        let mut cur = dir;
        while !cur.is_empty() {
            self.dirs.insert(cur.to_owned());
            cur = parent_path(cur);
        }
    }

    fn object(&self, path: &str) -> Result<&StoredObject, BackendError> {
        self.objects
            .get(path)
            .ok_or_else(|| BackendError::NotFound(path.to_owned()))
    }
}

/// A stream tail that fails every read, as a dropped connection does.
struct Severed;

impl AsyncRead for Severed {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "injected stream failure",
        )))
    }
}

struct Inner {
    store: RwLock<Store>,
    quota: Option<u64>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    capabilities: AtomicU8,
    hide_sizes: AtomicBool,
    failures: Mutex<FxHashMap<FailPoint, usize>>,
    /// The next opened stream breaks after this many bytes.
    sever: Mutex<Option<usize>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
    abouts: AtomicUsize,
}

/// An in-memory object store. Every optional capability is on by default.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("quota", &self.inner.quota)
            .finish_non_exhaustive()
    }
}

impl MemoryBackend {
    /// Create an empty store without a quota.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty store whose [`About`] capability reports `total` bytes of capacity.
    #[must_use]
    pub fn with_quota(total: u64) -> Self {
        Self::build(Some(total))
    }

    fn build(quota: Option<u64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: RwLock::new(Store::default()),
                quota,
                subscribers: Mutex::new(Vec::new()),
                capabilities: AtomicU8::new(Capabilities::all().bits()),
                hide_sizes: AtomicBool::new(false),
                failures: Mutex::new(FxHashMap::default()),
                sever: Mutex::new(None),
                gets: AtomicUsize::new(0),
                puts: AtomicUsize::new(0),
                abouts: AtomicUsize::new(0),
            }),
        }
    }

    /// Switch the optional capabilities in `caps` on or off.
    pub fn set_capabilities(&self, caps: Capabilities, enabled: bool) {
        if enabled {
            self.inner
                .capabilities
                .fetch_or(caps.bits(), Ordering::AcqRel);
        } else {
            self.inner
                .capabilities
                .fetch_and(!caps.bits(), Ordering::AcqRel);
        }
    }

    fn has(&self, cap: Capabilities) -> bool {
        Capabilities::from_bits_truncate(self.inner.capabilities.load(Ordering::Acquire))
            .contains(cap)
    }

    /// Report objects without a size, as backends that cannot know it up front do.
    pub fn set_hide_sizes(&self, hide: bool) {
        self.inner.hide_sizes.store(hide, Ordering::Release);
    }

    /// Make the next `count` calls at `point` fail with a transient error.
    pub fn fail_next(&self, point: FailPoint, count: usize) {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(point, count);
    }

    /// Make the next opened stream fail with a connection reset after `after` bytes.
    pub fn sever_next_stream(&self, after: usize) {
        *self
            .inner
            .sever
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(after);
    }

    fn check_fail(&self, point: FailPoint) -> Result<(), BackendError> {
        let mut failures = self
            .inner
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match failures.get_mut(&point) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(BackendError::Transient(format!("injected {point:?} failure")))
            }
            Some(_) | None => Ok(()),
        }
    }

    /// Number of [`Backend::open`] calls that opened a stream.
    #[must_use]
    pub fn gets(&self) -> usize {
        self.inner.gets.load(Ordering::Acquire)
    }

    /// Number of [`Backend::put`] calls that stored an object.
    #[must_use]
    pub fn puts(&self) -> usize {
        self.inner.puts.load(Ordering::Acquire)
    }

    /// Number of [`About::about`] queries.
    #[must_use]
    pub fn about_calls(&self) -> usize {
        self.inner.abouts.load(Ordering::Acquire)
    }

    fn info(&self, object: &StoredObject, path: &str) -> ObjectInfo {
        let mut info = object.info(path);
        if self.inner.hide_sizes.load(Ordering::Acquire) {
            info.size = None;
        }
        info
    }

    fn read_store(&self) -> std::sync::RwLockReadGuard<'_, Store> {
        self.inner
            .store
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_store(&self) -> std::sync::RwLockWriteGuard<'_, Store> {
        self.inner
            .store
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store an object as another client of the same store would, notifying subscribers.
    pub fn external_put(&self, path: &str, data: impl Into<Bytes>, mod_time: SystemTime) {
        self.write_store().objects.insert(
            path.to_owned(),
            StoredObject {
                data: data.into(),
                mod_time,
                tier: DEFAULT_TIER.to_owned(),
            },
        );
        self.notify(path, false);
    }

    /// Delete an object as another client would, notifying subscribers.
    pub fn external_remove(&self, path: &str) {
        self.write_store().objects.remove(path);
        self.notify(path, false);
    }

    /// Contents of the object at `path`, bypassing all accounting.
    #[must_use]
    pub fn contents(&self, path: &str) -> Option<Bytes> {
        self.read_store().objects.get(path).map(|o| o.data.clone())
    }

    /// Every stored object path, sorted.
    #[must_use]
    pub fn object_paths(&self) -> Vec<String> {
        self.read_store().objects.keys().cloned().collect()
    }

    fn notify(&self, path: &str, is_dir: bool) {
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subs.retain(|tx| {
            tx.send(ChangeEvent {
                path: path.to_owned(),
                is_dir,
            })
            .is_ok()
        });
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, BackendError> {
        self.check_fail(FailPoint::List)?;
        let store = self.read_store();
        if !store.dir_exists(dir) {
            return Err(BackendError::NotFound(dir.to_owned()));
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };

        let mut subdirs = BTreeSet::new();
        let mut entries = Vec::new();
        for (path, obj) in store.objects.range(prefix.clone()..) {
            let Some(rest) = path.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                None => entries.push(Entry::Object(self.info(obj, path))),
                Some((sub, _)) => {
                    subdirs.insert(sub.to_owned());
                }
            }
        }
        for d in store.dirs.range(prefix.clone()..) {
            let Some(rest) = d.strip_prefix(&prefix) else {
                break;
            };
            let sub = rest.split_once('/').map_or(rest, |(sub, _)| sub);
            subdirs.insert(sub.to_owned());
        }

        let now = SystemTime::now();
        entries.extend(subdirs.into_iter().map(|sub| {
            Entry::Dir(DirInfo {
                path: join_path(dir, &sub),
                mod_time: now,
            })
        }));
        Ok(entries)
    }

    async fn new_object(&self, path: &str) -> Result<ObjectInfo, BackendError> {
        self.read_store().object(path).map(|o| self.info(o, path))
    }

    async fn open(
        &self,
        object: &ObjectInfo,
        range: ReadRange,
    ) -> Result<ByteStream, BackendError> {
        self.check_fail(FailPoint::Open)?;
        let data = self.read_store().object(&object.path)?.data.clone();
        self.inner.gets.fetch_add(1, Ordering::AcqRel);
        let len = data.len() as u64;
        let start = range.offset.min(len);
        let end = range.len.map_or(len, |l| start.saturating_add(l).min(len));
        #[expect(
            clippy::cast_possible_truncation,
            reason = "bounded by the in-memory buffer length"
        )]
        let slice = data.slice(start as usize..end as usize);
        let sever = self
            .inner
            .sever
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(after) = sever {
            let head = slice.slice(..after.min(slice.len()));
            return Ok(Box::pin(std::io::Cursor::new(head).chain(Severed)));
        }
        Ok(Box::pin(std::io::Cursor::new(slice)))
    }

    #[instrument(name = "MemoryBackend::put", skip(self, data, meta))]
    async fn put(
        &self,
        path: &str,
        mut data: ByteStream,
        meta: PutMeta,
    ) -> Result<ObjectInfo, BackendError> {
        // Buffer everything first so a dropped future never leaves a partial object behind.
        let mut buf = Vec::with_capacity(meta.size.map_or(0, |s| usize::try_from(s).unwrap_or(0)));
        data.read_to_end(&mut buf).await?;
        self.check_fail(FailPoint::Put)?;
        debug!(bytes = buf.len(), "storing object");
        self.inner.puts.fetch_add(1, Ordering::AcqRel);

        let object = StoredObject {
            data: Bytes::from(buf),
            mod_time: meta.mod_time,
            tier: DEFAULT_TIER.to_owned(),
        };
        let info = self.info(&object, path);
        let mut store = self.write_store();
        store.add_dir_chain(parent_path(path));
        store.objects.insert(path.to_owned(), object);
        Ok(info)
    }

    async fn remove(&self, path: &str) -> Result<(), BackendError> {
        self.check_fail(FailPoint::Remove)?;
        self.write_store()
            .objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(path.to_owned()))
    }

    async fn mkdir(&self, dir: &str) -> Result<(), BackendError> {
        self.write_store().add_dir_chain(dir);
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> Result<(), BackendError> {
        let mut store = self.write_store();
        if !store.dir_exists(dir) {
            return Err(BackendError::NotFound(dir.to_owned()));
        }
        if store.has_children(dir) {
            return Err(BackendError::DirNotEmpty(dir.to_owned()));
        }
        store.dirs.remove(dir);
        Ok(())
    }

    fn mover(&self) -> Option<&dyn Mover> {
        self.has(Capabilities::MOVE).then_some(self as &dyn Mover)
    }

    fn copier(&self) -> Option<&dyn Copier> {
        self.has(Capabilities::COPY).then_some(self as &dyn Copier)
    }

    fn dir_mover(&self) -> Option<&dyn DirMover> {
        self.has(Capabilities::DIR_MOVE).then_some(self as &dyn DirMover)
    }

    fn about(&self) -> Option<&dyn About> {
        self.has(Capabilities::ABOUT).then_some(self as &dyn About)
    }

    fn mod_time_setter(&self) -> Option<&dyn ModTimeSetter> {
        self.has(Capabilities::SET_MOD_TIME).then_some(self as &dyn ModTimeSetter)
    }

    fn change_notifier(&self) -> Option<&dyn ChangeNotifier> {
        self.has(Capabilities::CHANGE_NOTIFY).then_some(self as &dyn ChangeNotifier)
    }

    fn public_linker(&self) -> Option<&dyn PublicLinker> {
        self.has(Capabilities::PUBLIC_LINK).then_some(self as &dyn PublicLinker)
    }

    fn tiering(&self) -> Option<&dyn Tiering> {
        self.has(Capabilities::TIERING).then_some(self as &dyn Tiering)
    }
}

#[async_trait]
impl Mover for MemoryBackend {
    async fn move_object(&self, src: &ObjectInfo, dst: &str) -> Result<ObjectInfo, BackendError> {
        self.check_fail(FailPoint::Move)?;
        let mut store = self.write_store();
        let object = store
            .objects
            .remove(&src.path)
            .ok_or_else(|| BackendError::NotFound(src.path.clone()))?;
        let info = self.info(&object, dst);
        store.add_dir_chain(parent_path(dst));
        store.objects.insert(dst.to_owned(), object);
        Ok(info)
    }
}

#[async_trait]
impl Copier for MemoryBackend {
    async fn copy_object(&self, src: &ObjectInfo, dst: &str) -> Result<ObjectInfo, BackendError> {
        self.check_fail(FailPoint::Copy)?;
        let mut store = self.write_store();
        let object = store.object(&src.path)?.clone();
        let info = self.info(&object, dst);
        store.add_dir_chain(parent_path(dst));
        store.objects.insert(dst.to_owned(), object);
        Ok(info)
    }
}

#[async_trait]
impl DirMover for MemoryBackend {
    async fn move_dir(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let mut store = self.write_store();
        if !store.dir_exists(src) {
            return Err(BackendError::NotFound(src.to_owned()));
        }
        let src_prefix = format!("{src}/");
        let rebase = |path: &str| -> Option<String> {
            path.strip_prefix(&src_prefix)
                .map(|rest| format!("{dst}/{rest}"))
        };

        let moved_objects: Vec<(String, String)> = store
            .objects
            .keys()
            .filter_map(|k| rebase(k).map(|new| (k.clone(), new)))
            .collect();
        for (old, new) in moved_objects {
            if let Some(obj) = store.objects.remove(&old) {
                store.objects.insert(new, obj);
            }
        }

        let moved_dirs: Vec<(String, String)> = store
            .dirs
            .iter()
            .filter_map(|d| rebase(d).map(|new| (d.clone(), new)))
            .collect();
        for (old, new) in moved_dirs {
            store.dirs.remove(&old);
            store.dirs.insert(new);
        }
        store.dirs.remove(src);
        store.add_dir_chain(dst);
        Ok(())
    }
}

#[async_trait]
impl About for MemoryBackend {
    async fn about(&self) -> Result<Usage, BackendError> {
        self.inner.abouts.fetch_add(1, Ordering::AcqRel);
        self.check_fail(FailPoint::About)?;
        let used: u64 = self
            .read_store()
            .objects
            .values()
            .map(|o| o.data.len() as u64)
            .sum();
        Ok(Usage {
            total: self.inner.quota,
            used: Some(used),
            free: self.inner.quota.map(|q| q.saturating_sub(used)),
        })
    }
}

#[async_trait]
impl ModTimeSetter for MemoryBackend {
    async fn set_mod_time(
        &self,
        path: &str,
        mod_time: SystemTime,
    ) -> Result<ObjectInfo, BackendError> {
        let mut store = self.write_store();
        let object = store
            .objects
            .get_mut(path)
            .ok_or_else(|| BackendError::NotFound(path.to_owned()))?;
        object.mod_time = mod_time;
        let object = object.clone();
        drop(store);
        Ok(self.info(&object, path))
    }
}

impl ChangeNotifier for MemoryBackend {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(tx);
        rx
    }
}

#[async_trait]
impl PublicLinker for MemoryBackend {
    async fn public_link(&self, path: &str) -> Result<String, BackendError> {
        self.read_store().object(path)?;
        Ok(format!("memory:///{path}"))
    }
}

#[async_trait]
impl Tiering for MemoryBackend {
    async fn tier(&self, path: &str) -> Result<String, BackendError> {
        Ok(self.read_store().object(path)?.tier.clone())
    }

    async fn set_tier(&self, path: &str, tier: &str) -> Result<(), BackendError> {
        let mut store = self.write_store();
        let object = store
            .objects
            .get_mut(path)
            .ok_or_else(|| BackendError::NotFound(path.to_owned()))?;
        tier.clone_into(&mut object.tier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use tokio::io::AsyncReadExt as _;

    use super::*;

    fn stream(data: &'static [u8]) -> ByteStream {
        Box::pin(std::io::Cursor::new(data))
    }

    fn meta() -> PutMeta {
        PutMeta {
            size: None,
            mod_time: SystemTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn list_reports_implicit_directories() {
        let backend = MemoryBackend::new();
        backend.put("a/b/c", stream(b"x"), meta()).await.unwrap();
        backend.put("top", stream(b"y"), meta()).await.unwrap();

        let root = backend.list("").await.unwrap();
        let leaves: Vec<_> = root.iter().map(Entry::leaf).collect();
        assert!(leaves.contains(&"a"));
        assert!(leaves.contains(&"top"));

        let inner = backend.list("a").await.unwrap();
        assert_eq!(inner.len(), 1);
        assert!(matches!(&inner[0], Entry::Dir(d) if d.path == "a/b"));
    }

    #[tokio::test]
    async fn rmdir_refuses_non_empty() {
        let backend = MemoryBackend::new();
        backend.put("d/f", stream(b"x"), meta()).await.unwrap();
        assert!(matches!(
            backend.rmdir("d").await,
            Err(BackendError::DirNotEmpty(_))
        ));
        backend.remove("d/f").await.unwrap();
        backend.rmdir("d").await.unwrap();
        assert!(matches!(
            backend.list("d").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn open_honours_range() {
        let backend = MemoryBackend::new();
        let info = backend
            .put("f", stream(b"0123456789"), meta())
            .await
            .unwrap();
        let mut out = Vec::new();
        backend
            .open(
                &info,
                ReadRange {
                    offset: 3,
                    len: Some(4),
                },
            )
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"3456");
    }

    #[tokio::test]
    async fn move_dir_rebases_children() {
        let backend = MemoryBackend::new();
        backend.put("src/a", stream(b"1"), meta()).await.unwrap();
        backend.mkdir("src/empty").await.unwrap();
        backend.move_dir("src", "dst").await.unwrap();
        assert_eq!(backend.contents("dst/a").unwrap(), Bytes::from_static(b"1"));
        assert!(backend.list("dst/empty").await.is_ok());
        assert!(backend.list("src").await.is_err());
    }

    #[tokio::test]
    async fn disabled_capabilities_are_not_advertised() {
        let backend = MemoryBackend::new();
        backend.set_capabilities(Capabilities::MOVE | Capabilities::ABOUT, false);
        assert!(backend.mover().is_none());
        assert!(Backend::about(&backend).is_none());
        assert!(backend.copier().is_some());
        backend.set_capabilities(Capabilities::MOVE, true);
        assert!(backend.mover().is_some());
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let backend = MemoryBackend::new();
        backend.fail_next(FailPoint::Put, 1);
        assert!(matches!(
            backend.put("f", stream(b"x"), meta()).await,
            Err(BackendError::Transient(_))
        ));
        assert!(backend.contents("f").is_none());
        backend.put("f", stream(b"x"), meta()).await.unwrap();
        assert_eq!(backend.puts(), 1);
    }

    #[tokio::test]
    async fn hidden_sizes_are_reported_as_unknown() {
        let backend = MemoryBackend::new();
        backend.put("f", stream(b"abc"), meta()).await.unwrap();
        backend.set_hide_sizes(true);
        assert_eq!(backend.new_object("f").await.unwrap().size, None);
        let listed = backend.list("").await.unwrap();
        assert!(matches!(&listed[0], Entry::Object(o) if o.size.is_none()));
    }
}
