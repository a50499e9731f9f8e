//! A backend that stores objects as plain files under a root directory.
//!
//! Uploads land in a hidden temporary file next to their destination and are renamed into place,
//! so an interrupted upload never replaces the previous object.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tracing::{debug, instrument, warn};

use super::{
    Backend, BackendError, ByteStream, Copier, DirInfo, DirMover, Entry, ModTimeSetter, Mover,
    ObjectInfo, PutMeta, ReadRange, join_path,
};

const TEMP_PREFIX: &str = ".remote-vfs-upload-";

/// Objects as files below a root directory.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
    temp_counter: AtomicU64,
}

#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; everything else is plain I/O"
)]
fn map_io(path: &str, e: std::io::Error) -> BackendError {
    match e.kind() {
        std::io::ErrorKind::NotFound => BackendError::NotFound(path.to_owned()),
        std::io::ErrorKind::DirectoryNotEmpty => BackendError::DirNotEmpty(path.to_owned()),
        _ => BackendError::Io(e),
    }
}

impl LocalBackend {
    /// Use `root` as the store. The directory is created if missing.
    pub async fn new(root: &Path) -> Result<Self, BackendError> {
        tokio::fs::create_dir_all(root).await?;
        let root = tokio::fs::canonicalize(root).await?;
        Ok(Self {
            root,
            temp_counter: AtomicU64::new(0),
        })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |acc, seg| acc.join(seg))
    }

    async fn info_for(&self, path: &str) -> Result<ObjectInfo, BackendError> {
        let meta = tokio::fs::metadata(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))?;
        if meta.is_dir() {
            return Err(BackendError::NotFound(path.to_owned()));
        }
        Ok(ObjectInfo {
            path: path.to_owned(),
            size: Some(meta.len()),
            mod_time: meta.modified()?,
            hash: None,
        })
    }

    fn set_file_mtime(target: &Path, mod_time: SystemTime) -> Result<(), std::io::Error> {
        let file = std::fs::OpenOptions::new().write(true).open(target)?;
        file.set_modified(mod_time)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, BackendError> {
        let mut reader = tokio::fs::read_dir(self.resolve(dir))
            .await
            .map_err(|e| map_io(dir, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(path = ?entry.path(), "skipping entry with a non UTF-8 name");
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let meta = entry.metadata().await?;
            let path = join_path(dir, &name);
            let mod_time = meta.modified()?;
            if meta.is_dir() {
                entries.push(Entry::Dir(DirInfo { path, mod_time }));
            } else {
                entries.push(Entry::Object(ObjectInfo {
                    path,
                    size: Some(meta.len()),
                    mod_time,
                    hash: None,
                }));
            }
        }
        Ok(entries)
    }

    async fn new_object(&self, path: &str) -> Result<ObjectInfo, BackendError> {
        self.info_for(path).await
    }

    async fn open(
        &self,
        object: &ObjectInfo,
        range: ReadRange,
    ) -> Result<ByteStream, BackendError> {
        let mut file = tokio::fs::File::open(self.resolve(&object.path))
            .await
            .map_err(|e| map_io(&object.path, e))?;
        if range.offset > 0 {
            file.seek(SeekFrom::Start(range.offset)).await?;
        }
        match range.len {
            Some(len) => Ok(Box::pin(file.take(len))),
            None => Ok(Box::pin(file)),
        }
    }

    #[instrument(name = "LocalBackend::put", skip(self, data, meta))]
    async fn put(
        &self,
        path: &str,
        mut data: ByteStream,
        meta: PutMeta,
    ) -> Result<ObjectInfo, BackendError> {
        let target = self.resolve(path);
        let parent = target
            .parent()
            .ok_or_else(|| BackendError::Permanent(format!("cannot store at the root: {path}")))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = parent.join(format!("{TEMP_PREFIX}{}-{seq}", std::process::id()));

        // Removes the temporary file unless the rename below consumed it.
        struct TempGuard(Option<PathBuf>);
        impl Drop for TempGuard {
            fn drop(&mut self) {
                if let Some(p) = self.0.take() {
                    let _ = std::fs::remove_file(p);
                }
            }
        }
        let mut guard = TempGuard(Some(temp.clone()));

        let mut out = tokio::fs::File::create(&temp).await?;
        let copied = tokio::io::copy(&mut data, &mut out).await?;
        out.sync_all().await?;
        drop(out);

        let temp_for_mtime = temp.clone();
        tokio::task::spawn_blocking(move || Self::set_file_mtime(&temp_for_mtime, meta.mod_time))
            .await
            .map_err(|e| BackendError::Io(std::io::Error::other(e)))??;

        tokio::fs::rename(&temp, &target).await?;
        guard.0 = None;
        debug!(bytes = copied, "stored object");

        Ok(ObjectInfo {
            path: path.to_owned(),
            size: Some(copied),
            mod_time: meta.mod_time,
            hash: None,
        })
    }

    async fn remove(&self, path: &str) -> Result<(), BackendError> {
        tokio::fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn mkdir(&self, dir: &str) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(self.resolve(dir))
            .await
            .map_err(|e| map_io(dir, e))
    }

    async fn rmdir(&self, dir: &str) -> Result<(), BackendError> {
        tokio::fs::remove_dir(self.resolve(dir))
            .await
            .map_err(|e| map_io(dir, e))
    }

    fn mover(&self) -> Option<&dyn Mover> {
        Some(self)
    }

    fn copier(&self) -> Option<&dyn Copier> {
        Some(self)
    }

    fn dir_mover(&self) -> Option<&dyn DirMover> {
        Some(self)
    }

    fn mod_time_setter(&self) -> Option<&dyn ModTimeSetter> {
        Some(self)
    }
}

#[async_trait]
impl Mover for LocalBackend {
    async fn move_object(&self, src: &ObjectInfo, dst: &str) -> Result<ObjectInfo, BackendError> {
        let target = self.resolve(dst);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.resolve(&src.path), &target)
            .await
            .map_err(|e| map_io(&src.path, e))?;
        self.info_for(dst).await
    }
}

#[async_trait]
impl Copier for LocalBackend {
    async fn copy_object(&self, src: &ObjectInfo, dst: &str) -> Result<ObjectInfo, BackendError> {
        let data = self.open(src, ReadRange::default()).await?;
        self.put(
            dst,
            data,
            PutMeta {
                size: src.size,
                mod_time: src.mod_time,
            },
        )
        .await
    }
}

#[async_trait]
impl DirMover for LocalBackend {
    async fn move_dir(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let target = self.resolve(dst);
        if tokio::fs::try_exists(&target).await? {
            return Err(BackendError::Permanent(format!("destination exists: {dst}")));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.resolve(src), target)
            .await
            .map_err(|e| map_io(src, e))
    }
}

#[async_trait]
impl ModTimeSetter for LocalBackend {
    async fn set_mod_time(
        &self,
        path: &str,
        mod_time: SystemTime,
    ) -> Result<ObjectInfo, BackendError> {
        let target = self.resolve(path);
        tokio::task::spawn_blocking(move || Self::set_file_mtime(&target, mod_time))
            .await
            .map_err(|e| BackendError::Io(std::io::Error::other(e)))?
            .map_err(|e| map_io(path, e))?;
        self.info_for(path).await
    }
}
