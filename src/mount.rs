//! Mount lifecycle: build the filesystem, serve it over FUSE until a signal arrives, then unmount
//! and drain pending uploads.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::select;
use tracing::{debug, info, warn};

use remote_vfs::backend::{Backend, BackendError, LocalBackend, MemoryBackend};
use remote_vfs::fs::{Vfs, VfsError};

use crate::app_config::{BackendConfig, Config};

#[derive(Debug, Error)]
pub enum MountError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not open the backend: {0}")]
    Backend(#[from] BackendError),

    #[error("Filesystem shutdown failed: {0}")]
    Vfs(#[from] VfsError),
}

mod managed_fuse {
    //! fuser only does a regular unmount when the `BackgroundSession` is dropped. A busy mount
    //! would then linger, so [`ManagedFuse`] follows up with a forced unmount.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use fuser::BackgroundSession;
    use nix::errno::Errno;
    use tracing::{debug, error};

    use remote_vfs::fs::Vfs;
    use remote_vfs::fs::fuser::FuserAdapter;

    pub struct ManagedFuse {
        mount_point: PathBuf,
        read_only: bool,
    }

    impl ManagedFuse {
        pub fn new(mount_point: PathBuf, read_only: bool) -> Self {
            Self {
                mount_point,
                read_only,
            }
        }

        pub fn spawn(
            &self,
            vfs: Arc<Vfs>,
            handle: tokio::runtime::Handle,
        ) -> Result<BackgroundSession, std::io::Error> {
            let adapter = FuserAdapter::new(vfs, handle);
            let mut mount_opts = vec![
                fuser::MountOption::FSName("remote-vfs".to_owned()),
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
                fuser::MountOption::AllowOther,
            ];
            mount_opts.push(if self.read_only {
                fuser::MountOption::RO
            } else {
                fuser::MountOption::RW
            });

            fuser::spawn_mount2(adapter, &self.mount_point, &mount_opts)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for attempt in 1..=UMOUNT_ATTEMPT_COUNT {
                #[cfg(target_os = "macos")]
                let result =
                    nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE);
                #[cfg(target_os = "linux")]
                let result =
                    nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH);

                match result {
                    Ok(()) => {
                        debug!(attempt, "Unmounted FUSE filesystem.");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt, "FUSE filesystem still busy, retrying...");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt, "FUSE filesystem already unmounted.");
                        break;
                    }
                    Err(e) => {
                        error!(attempt, error = %e, "Failed to unmount FUSE filesystem.");
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// A missing directory is created. An existing one must be empty.
async fn prepare_mount_point(mount_point: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

async fn open_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
    Ok(match config {
        BackendConfig::Local { root } => Arc::new(LocalBackend::new(root).await?),
        BackendConfig::Memory => {
            warn!("Serving an in-memory backend. Everything written is lost on unmount.");
            Arc::new(MemoryBackend::new())
        }
    })
}

/// Mount, serve until a termination signal, then unmount and shut the filesystem down.
pub async fn run(config: Config, handle: tokio::runtime::Handle) -> Result<(), MountError> {
    tokio::fs::create_dir_all(&config.cache.path).await?;
    prepare_mount_point(&config.mount_point).await?;

    let backend = open_backend(&config.backend).await?;
    let vfs = Arc::new(Vfs::new(backend, config.vfs_options()));

    info!(
        mount_point = %config.mount_point.display(),
        mode = %vfs.cache_mode(),
        "Mounting filesystem."
    );

    let fuse = managed_fuse::ManagedFuse::new(config.mount_point.clone(), config.read_only);
    {
        let _session = fuse.spawn(Arc::clone(&vfs), handle)?;
        info!("remote-vfs is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
    }
    drop(fuse);

    vfs.shutdown().await?;
    info!("Filesystem shut down.");
    Ok(())
}

pub fn spawn(config: Config) -> Result<(), MountError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
