//! FUSE availability checks, run before mounting so a missing driver gives a readable error
//! instead of a bare mount failure.

#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::path::Path;

#[cfg(target_os = "linux")]
const FUSE_DEVICE: &str = "/dev/fuse";

#[cfg(target_os = "linux")]
const FUSERMOUNT_BINARIES: [&str; 2] = ["fusermount3", "fusermount"];

#[cfg(target_os = "macos")]
const MACFUSE_BUNDLES: [&str; 2] = [
    "/Library/Filesystems/macfuse.fs",
    "/Library/Filesystems/osxfuse.fs",
];

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    #[cfg(target_os = "linux")]
    /// The kernel module is not loaded, or the device node is missing.
    #[error(
        "{device} does not exist. Load the fuse kernel module (`modprobe fuse`) or install \
         your distribution's fuse package."
    )]
    DeviceMissing {
        /// The device node that was expected.
        device: &'static str,
    },

    #[cfg(target_os = "linux")]
    /// The device exists but this user may not open it.
    #[error("{device} is not accessible by the current user: {source}")]
    DeviceInaccessible {
        /// The device node that was checked.
        device: &'static str,
        /// Why opening it failed.
        source: nix::errno::Errno,
    },

    #[cfg(target_os = "linux")]
    /// No setuid mount helper was found on `PATH`.
    #[error("Neither fusermount3 nor fusermount is on PATH. Install fuse3 (or fuse).")]
    HelperMissing,

    #[cfg(target_os = "macos")]
    /// macFUSE is not installed at all.
    #[error(
        "macFUSE is not installed. remote-vfs requires macFUSE to mount filesystems.\n\
         Install it from: https://macfuse.github.io/"
    )]
    NotInstalled,
}

#[cfg(any(target_os = "linux", test))]
fn on_path(binary: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
    })
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On Linux this checks the FUSE device and looks for the unprivileged mount helper.
#[cfg(target_os = "linux")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;

    if !Path::new(FUSE_DEVICE).exists() {
        return Err(FuseCheckError::DeviceMissing {
            device: FUSE_DEVICE,
        });
    }

    // Root mounts without the helper. Everyone else needs it and read-write access to the device.
    if nix::unistd::Uid::effective().is_root() {
        return Ok(());
    }

    let fd = nix::fcntl::open(FUSE_DEVICE, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|source| FuseCheckError::DeviceInaccessible {
            device: FUSE_DEVICE,
            source,
        })?;
    // Nothing useful to do if closing the test descriptor fails.
    let _ = nix::unistd::close(fd);

    if !FUSERMOUNT_BINARIES.iter().any(|b| on_path(b)) {
        return Err(FuseCheckError::HelperMissing);
    }
    Ok(())
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On macOS this checks for a macFUSE or osxfuse bundle.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if MACFUSE_BUNDLES.iter().any(|b| Path::new(b).is_dir()) {
        Ok(())
    } else {
        Err(FuseCheckError::NotInstalled)
    }
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// Other platforms are not checked.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    Ok(())
}
