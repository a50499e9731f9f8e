use thiserror::Error;

use crate::backend::BackendError;
use crate::cache::staging::StagingRootError;

/// Errors returned by every VFS operation.
#[derive(Debug, Error)]
pub enum VfsError {
    /// A path segment does not exist.
    #[error("no such file or directory")]
    NotExist,

    /// The target already exists, or a file sits where a directory was expected.
    #[error("file already exists")]
    AlreadyExists,

    /// The directory still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// The filesystem was mounted read-only.
    #[error("read-only file system")]
    ReadOnly,

    /// The handle was already closed.
    #[error("file already closed")]
    Closed,

    /// The backend or the current cache mode cannot perform this operation.
    #[error("operation not supported")]
    Unsupported,

    /// The open flags or the handle's access mode forbid the operation.
    #[error("operation not permitted")]
    PermissionDenied,

    /// A directory was used where a file was required.
    #[error("is a directory")]
    IsDir,

    /// A file was used where a directory was required.
    #[error("not a directory")]
    NotDir,

    /// An argument was out of range.
    #[error("invalid argument")]
    InvalidArgument,

    /// A retryable backend failure.
    #[error("transient backend failure: {0}")]
    BackendTransient(String),

    /// A non-retryable backend failure.
    #[error("backend failure: {0}")]
    BackendPermanent(String),

    /// The upload was abandoned before it completed.
    #[error("upload aborted")]
    UploadAborted,

    /// Local staging I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for VfsError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(_) => Self::NotExist,
            BackendError::DirNotEmpty(_) => Self::NotEmpty,
            BackendError::Unsupported => Self::Unsupported,
            BackendError::Transient(msg) => Self::BackendTransient(msg),
            BackendError::Permanent(msg) => Self::BackendPermanent(msg),
            BackendError::Aborted => Self::UploadAborted,
            BackendError::Io(e) => Self::Io(e),
        }
    }
}

impl From<StagingRootError> for VfsError {
    fn from(e: StagingRootError) -> Self {
        match e {
            StagingRootError::Io(e) => Self::Io(e),
            other @ (StagingRootError::NotADirectory(_)
            | StagingRootError::RootPathUnsafeCache(_)) => {
                Self::Io(std::io::Error::other(other.to_string()))
            }
        }
    }
}

impl From<VfsError> for i32 {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotExist => libc::ENOENT,
            VfsError::AlreadyExists => libc::EEXIST,
            VfsError::NotEmpty => libc::ENOTEMPTY,
            VfsError::ReadOnly => libc::EROFS,
            VfsError::Closed => libc::EBADF,
            VfsError::Unsupported => libc::ENOSYS,
            VfsError::PermissionDenied => libc::EPERM,
            VfsError::IsDir => libc::EISDIR,
            VfsError::NotDir => libc::ENOTDIR,
            VfsError::InvalidArgument => libc::EINVAL,
            VfsError::BackendTransient(_) => libc::EAGAIN,
            VfsError::BackendPermanent(_) => libc::EIO,
            VfsError::UploadAborted => libc::ECANCELED,
            VfsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_kind() {
        let e: VfsError = BackendError::NotFound("a".into()).into();
        assert_eq!(i32::from(e), libc::ENOENT);
        let e: VfsError = BackendError::Transient("timeout".into()).into();
        assert_eq!(i32::from(e), libc::EAGAIN);
        let e: VfsError = BackendError::Aborted.into();
        assert_eq!(i32::from(e), libc::ECANCELED);
    }

    #[test]
    fn io_errors_keep_raw_errno() {
        let e = VfsError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(i32::from(e), libc::ENOSPC);
        let e = VfsError::Io(std::io::Error::other("synthetic"));
        assert_eq!(i32::from(e), libc::EIO);
    }
}
