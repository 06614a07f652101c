use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;

use super::{CacheBackend, CacheBackendError};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    /// When to evict this item, if ever.
    deadline: Option<Instant>,
    /// The actual data.
    data: Bytes,
}

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] deadline as the
/// explicit expiration time.
struct ItemExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<String, InMemoryItem> for ItemExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &InMemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        value
            .deadline
            .and_then(|deadline| saturating_duration_since(current_time, deadline))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &InMemoryItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value
            .deadline
            .and_then(|deadline| saturating_duration_since(current_time, deadline))
    }
}

/// A process-local backend on top of a bounded moka cache.
///
/// This never fails, which makes it the default for single instance deployments and tests.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    cache: moka::future::Cache<String, InMemoryItem>,
}

impl MemoryBackend {
    /// Creates a backend holding at most `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(capacity)
            .name("revalidator")
            .expire_after(ItemExpiration)
            .build();
        Self { cache }
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheBackendError>> {
        Box::pin(async move { Ok(self.cache.get(key).await.map(|item| item.data)) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheBackendError>> {
        Box::pin(async move {
            let item = InMemoryItem {
                deadline: ttl.map(|ttl| Instant::now() + ttl),
                data: value,
            };
            self.cache.insert(key.to_owned(), item).await;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheBackendError>> {
        Box::pin(async move {
            self.cache.invalidate(key).await;
            Ok(())
        })
    }
}
