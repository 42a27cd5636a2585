//! Cache configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "KILN_CACHE_DIR";

/// Local cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory
    pub root: PathBuf,
    /// Re-hash blobs on write, including blobs that already exist
    #[serde(default)]
    pub verify_writes: bool,
}

impl CacheConfig {
    /// Configuration rooted at `root`
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            verify_writes: false,
        }
    }

    /// Enable/disable write verification
    #[must_use]
    pub fn with_verify_writes(mut self, verify: bool) -> Self {
        self.verify_writes = verify;
        self
    }

    /// Resolve the default root: `$KILN_CACHE_DIR`, then
    /// `$XDG_CACHE_HOME/kiln`, then `$HOME/.cache/kiln`, then the system
    /// temp dir.
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var_os(CACHE_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("XDG_CACHE_HOME").map(|d| PathBuf::from(d).join("kiln")))
            .or_else(|| {
                std::env::var_os("HOME").map(|d| PathBuf::from(d).join(".cache").join("kiln"))
            })
            .unwrap_or_else(|| std::env::temp_dir().join("kiln"));
        Self::at(root)
    }

    /// Directory holding blobs and the index
    #[must_use]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
