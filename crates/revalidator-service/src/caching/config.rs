use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCacheConfig {
    /// The maximum number of entries held in memory.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemCacheConfig {
    /// The directory holding the cache files.
    pub path: PathBuf,
}

/// The kind of backend, along with its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory(MemoryCacheConfig),
    Filesystem(FilesystemCacheConfig),
}

impl Default for CacheBackendKind {
    fn default() -> Self {
        Self::Memory(MemoryCacheConfig::default())
    }
}

/// The backend to use for the cache, keyed by its kind:
///
/// ```yaml
/// backend:
///   filesystem:
///     path: /var/cache/revalidator
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheBackendConfig {
    #[serde(flatten)]
    pub kind: CacheBackendKind,
}

/// Configuration of the cache in front of the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// The backend to use for the cache.
    pub backend: CacheBackendConfig,

    /// The time after which a single backend operation is abandoned.
    ///
    /// The cache is an optimization only. A slow backend is treated exactly like an
    /// unavailable one, so that it can not stall queries.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// How long the backend keeps entries around.
    ///
    /// This is unrelated to the freshness of values. Expired values are kept so they can still
    /// be served when the origin fails, so by default entries are retained indefinitely.
    #[serde(with = "humantime_serde")]
    pub retention: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendConfig::default(),
            operation_timeout: Duration::from_millis(500),
            retention: None,
        }
    }
}

fn default_capacity() -> u64 {
    100_000
}
