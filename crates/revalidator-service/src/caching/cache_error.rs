use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error talking to a cache backend.
///
/// None of these are ever surfaced to callers of a query. The [`Cache`](super::Cache) reports
/// them and treats the operation as a miss or a no-op.
#[derive(Debug, Error)]
pub enum CacheBackendError {
    /// The backend did not answer within the configured operation timeout.
    #[error("cache backend timed out after {0:?}")]
    Timeout(Duration),
    /// The backend refused or could not serve the operation.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    /// Reading or writing the backing storage failed.
    #[error("cache backend io error")]
    Io(#[from] io::Error),
    /// A stored entry could not be encoded or decoded.
    #[error("malformed cache entry")]
    Serialization(#[from] serde_json::Error),
}

impl CacheBackendError {
    /// A short name of this error for metric tags.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Io(_) => "io",
            Self::Serialization(_) => "malformed",
        }
    }
}
