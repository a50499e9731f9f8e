//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use remote_vfs::cache::CacheMode;
use remote_vfs::fs::VfsOptions;

fn runtime_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::runtime_dir() {
        return Some(path.join("remote-vfs"));
    }

    dirs::home_dir().map(|path| path.join(".local").join("share").join("remote-vfs"))
}

fn default_mount_point() -> PathBuf {
    runtime_dir().map_or_else(|| PathBuf::from("/tmp/remote-vfs/mnt"), |rd| rd.join("mnt"))
}

fn default_cache_path() -> PathBuf {
    runtime_dir().map_or_else(
        || PathBuf::from("/tmp/remote-vfs/cache"),
        |rd| rd.join("cache"),
    )
}

fn default_backend_root() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from("/tmp/remote-vfs/data"), |h| h.join("remote"))
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

const fn default_dir_cache_time() -> u64 {
    300
}

const fn default_write_wait() -> u64 {
    10
}

const fn default_poll_interval() -> u64 {
    60
}

const fn default_dir_perms() -> u32 {
    0o777
}

const fn default_file_perms() -> u32 {
    0o666
}

const fn default_umask() -> u16 {
    0o022
}

/// Which store the filesystem exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// A directory on the local disk, treated as an object store.
    Local {
        /// The directory holding the objects.
        root: PathBuf,
    },
    /// A volatile in-memory store, gone once unmounted.
    Memory,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local {
            root: default_backend_root(),
        }
    }
}

/// The staging cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// How much file content is buffered locally.
    #[serde(default)]
    pub mode: CacheMode,

    /// The path to the staging directory.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// The maximum size of idle staged copies in full mode.
    pub max_size: Option<ByteSize>,

    /// Idle staged copies older than this many seconds are evicted in full mode.
    pub max_age: Option<u64>,

    /// Seconds between two passes of the full-mode cleaner.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::default(),
            path: default_cache_path(),
            max_size: None,
            max_age: Some(3600),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// Reject every write to the filesystem.
    #[serde(default)]
    pub read_only: bool,

    /// Seconds a directory listing is trusted before it is fetched again.
    #[serde(default = "default_dir_cache_time")]
    pub dir_cache_time: u64,

    /// Seconds to wait for open writers when unmounting.
    #[serde(default = "default_write_wait")]
    pub write_wait: u64,

    /// Permission bits for directories, before the umask.
    #[serde(default = "default_dir_perms")]
    pub dir_perms: u32,

    /// Permission bits for files, before the umask.
    #[serde(default = "default_file_perms")]
    pub file_perms: u32,

    #[serde(default = "default_umask")]
    pub umask: u16,

    /// The user owning every node. If not specified, the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group owning every node. If not specified, the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            cache: CacheConfig::default(),
            mount_point: default_mount_point(),
            read_only: false,
            dir_cache_time: default_dir_cache_time(),
            write_wait: default_write_wait(),
            dir_perms: default_dir_perms(),
            file_perms: default_file_perms(),
            umask: default_umask(),
            uid: current_uid(),
            gid: current_gid(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parent directory does not exist.")]
    NoParentDir,

    #[error("No suitable configuration path found.")]
    NoSuitableConfigPath,
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` listing every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.mount_point.is_absolute() {
            errors.push(format!(
                "Mount point '{}' must be an absolute path.",
                self.mount_point.display()
            ));
        }

        if !self.cache.path.is_absolute() {
            errors.push(format!(
                "Cache path '{}' must be an absolute path.",
                self.cache.path.display()
            ));
        }

        if let BackendConfig::Local { root } = &self.backend {
            if !root.is_absolute() {
                errors.push(format!(
                    "Backend root '{}' must be an absolute path.",
                    root.display()
                ));
            }
            if root.starts_with(&self.mount_point) || self.mount_point.starts_with(root) {
                errors.push("Backend root and mount point must not contain each other.".to_owned());
            }
        }

        if self.cache.max_size.is_some_and(|s| s.as_u64() == 0) {
            errors.push("cache.max-size must be larger than zero.".to_owned());
        }

        if self.dir_perms > 0o7777 || self.file_perms > 0o7777 {
            errors.push("dir-perms and file-perms must be at most 0o7777.".to_owned());
        }

        if self.umask > 0o777 {
            errors.push(format!("umask {:#o} is larger than 0o777.", self.umask));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The library options this configuration describes.
    pub fn vfs_options(&self) -> VfsOptions {
        VfsOptions {
            cache_mode: self.cache.mode,
            dir_cache_time: Duration::from_secs(self.dir_cache_time),
            dir_perms: self.dir_perms,
            file_perms: self.file_perms,
            umask: self.umask,
            read_only: self.read_only,
            uid: self.uid,
            gid: self.gid,
            cache_dir: self.cache.path.clone(),
            cache_max_size: self.cache.max_size.map(|s| s.as_u64()),
            cache_max_age: self.cache.max_age.map(Duration::from_secs),
            cache_poll_interval: Duration::from_secs(self.cache.poll_interval),
            write_wait: Duration::from_secs(self.write_wait),
            ..VfsOptions::default()
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("remote-vfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("remote-vfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/remote-vfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config or writes the defaults if none exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_create(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(res) = Self::load(external_config_path) {
            let config = res?;
            if let Err(validation_errors) = config.validate() {
                return Err(ConfigError::ValidationErrors(validation_errors));
            }
            debug!("Loaded configuration successfully.");
            return Ok(config);
        }

        let creation_path = Self::config_search_paths()
            .into_iter()
            .next()
            .ok_or(ConfigError::NoSuitableConfigPath)?;

        let config = Self::default();
        config.write_to_disk(&creation_path)?;
        info!(path = ?creation_path.display(), "Created configuration file.");
        Ok(config)
    }

    fn write_to_disk(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::create_dir_all(path.parent().ok_or(ConfigError::NoParentDir)?)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}
