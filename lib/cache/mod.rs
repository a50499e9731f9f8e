//! Local buffering of file content.

/// Mode-aware front for the staging area and its eviction policy.
pub mod engine;
/// Cache eviction policies.
pub mod eviction;
/// On-disk staging area shared by file handles.
pub mod staging;
/// Size and age bookkeeping for idle staged copies.
pub mod tracker;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use engine::CacheEngine;

/// How much file content is buffered locally.
///
/// The variants are ordered: each one buffers at least as much as the one before it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Reads stream from the backend, writes stream straight into an upload.
    #[default]
    Off,
    /// Writes are staged locally and uploaded on close. Reads stream.
    Minimal,
    /// Like [`CacheMode::Minimal`], and a single handle may both read and write.
    Writes,
    /// Every open is served from a local copy that outlives the handle.
    Full,
}

impl CacheMode {
    const ALL: [Self; 4] = [Self::Off, Self::Minimal, Self::Writes, Self::Full];

    /// The lowercase name used in configuration files and on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Writes => "writes",
            Self::Full => "full",
        }
    }

    pub(crate) fn to_bits(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Minimal => 1,
            Self::Writes => 2,
            Self::Full => 3,
        }
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        Self::ALL
            .get(usize::from(bits))
            .copied()
            .unwrap_or(Self::Off)
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown cache mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cache mode {0:?}, expected one of off, minimal, writes, full")]
pub struct UnknownCacheMode(String);

impl FromStr for CacheMode {
    type Err = UnknownCacheMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownCacheMode(s.to_owned()))
    }
}
