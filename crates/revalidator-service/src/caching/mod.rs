//! # Caching infrastructure
//!
//! The cache sits in front of a slow origin and is purely an optimization. Every code path
//! above it stays correct if every cache operation silently does nothing.
//!
//! ## Layers
//!
//! - A [`CacheBackend`] stores raw bytes per key. [`MemoryBackend`] keeps them in a bounded
//!   in-process moka cache, [`FilesystemBackend`] stores one file per key in a directory that can
//!   be shared between processes.
//! - The [`Cache`] on top (de)serializes [`CacheEntry`]s, stamps them with the time they were
//!   stored, and applies the failure policy: every backend operation is bounded by a timeout,
//!   failures are reported through the [`ErrorReporter`](crate::reporting::ErrorReporter), and a
//!   failed `get` is a miss while a failed `set` or `remove` is a no-op.
//!
//! ## Freshness
//!
//! Whether a stored value may be served is decided by the [`FreshnessPolicy`] of the query that
//! owns the key, based on the age of the entry:
//!
//! - [`Freshness::Fresh`]: younger than `stale_after`, served as is.
//! - [`Freshness::Stale`]: older than `stale_after` but younger than `max_age` (if any), served
//!   while a background revalidation is queued.
//! - [`Freshness::Expired`]: older than `max_age`, or not cached at all. Fetched synchronously.
//!
//! Entries are never deleted because they got old. An expired entry is still the last known
//! value and is served when the origin fails. Backends only forget entries after the
//! configured [`CacheConfig::retention`], or when an entry is explicitly removed.
//!
//! ### Metrics
//!
//! - `cache.get`: tagged with `status` `hit`, `miss` or `error`.
//! - `cache.set` / `cache.remove`: tagged with `status` `ok` or `error`.
//!
//! Errors are additionally tagged with `errdetails`, see [`CacheBackendError::as_tag`].

mod backend;
mod cache;
mod cache_error;
mod config;
mod entry;
mod fs;
mod memory;
#[cfg(test)]
mod tests;

pub use backend::{BackendRef, CacheBackend};
pub use cache::Cache;
pub use cache_error::CacheBackendError;
pub use config::{
    CacheBackendConfig, CacheBackendKind, CacheConfig, FilesystemCacheConfig, MemoryCacheConfig,
};
pub use entry::{CacheEntry, Freshness, FreshnessPolicy};
pub use fs::FilesystemBackend;
pub use memory::MemoryBackend;
