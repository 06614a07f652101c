use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use super::CacheBackendError;

/// Raw key/value storage behind the [`Cache`](super::Cache).
///
/// Backends may fail however they like. The [`Cache`](super::Cache) on top takes care of
/// timeouts, reporting and degrading failures into misses.
pub trait CacheBackend: fmt::Debug + Send + Sync {
    /// The name of this backend for logs, metrics and reports.
    fn name(&self) -> &'static str;

    /// Loads the bytes stored at `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheBackendError>>;

    /// Stores `value` at `key`, replacing any previous value.
    ///
    /// With a `ttl` the backend is free to forget the value once it has elapsed.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheBackendError>>;

    /// Removes the value stored at `key`, if any.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheBackendError>>;
}

pub type BackendRef = Arc<dyn CacheBackend>;
