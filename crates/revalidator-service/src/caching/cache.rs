use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::clock::ClockRef;
use crate::reporting::{ErrorReport, ReporterRef};

use super::config::{CacheBackendKind, CacheConfig};
use super::entry::CacheEntryRef;
use super::{BackendRef, CacheBackendError, CacheEntry, FilesystemBackend, MemoryBackend};

/// A best-effort typed cache over a [`CacheBackend`](super::CacheBackend).
///
/// None of the operations ever fail. Backend errors and timeouts are reported and turn into a
/// miss for [`get`](Self::get), and into a no-op for [`set`](Self::set) and
/// [`remove`](Self::remove).
#[derive(Debug, Clone)]
pub struct Cache {
    backend: BackendRef,
    clock: ClockRef,
    reporter: ReporterRef,
    operation_timeout: Duration,
    retention: Option<Duration>,
}

impl Cache {
    pub fn new(backend: BackendRef, clock: ClockRef, reporter: ReporterRef) -> Self {
        let defaults = CacheConfig::default();
        Self {
            backend,
            clock,
            reporter,
            operation_timeout: defaults.operation_timeout,
            retention: defaults.retention,
        }
    }

    /// Creates the configured backend and a cache on top of it.
    pub fn from_config(config: &CacheConfig, clock: ClockRef, reporter: ReporterRef) -> Result<Self> {
        let backend: BackendRef = match &config.backend.kind {
            CacheBackendKind::Memory(cfg) => Arc::new(MemoryBackend::new(cfg.capacity)),
            CacheBackendKind::Filesystem(cfg) => {
                std::fs::create_dir_all(&cfg.path)?;
                Arc::new(FilesystemBackend::new(&cfg.path))
            }
        };
        tracing::info!(backend = backend.name(), "Initialized cache backend");

        Ok(Self {
            operation_timeout: config.operation_timeout,
            retention: config.retention,
            ..Self::new(backend, clock, reporter)
        })
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &BackendRef {
        &self.backend
    }

    /// Looks up the entry stored at `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let result = self
            .run("get", self.backend.get(key))
            .await
            .and_then(|bytes| match bytes {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            });

        match result {
            Ok(Some(entry)) => {
                metric!(counter("cache.get") += 1, "status" => "hit");
                Some(entry)
            }
            Ok(None) => {
                metric!(counter("cache.get") += 1, "status" => "miss");
                None
            }
            Err(err) => {
                self.report("get", key, &err);
                None
            }
        }
    }

    /// Stores `value` at `key`, stamped with the current time.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, source: Option<&str>) {
        let entry = CacheEntryRef {
            value,
            stored_at: self.clock.now(),
            source,
        };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                self.report("set", key, &err.into());
                return;
            }
        };

        match self
            .run("set", self.backend.set(key, bytes, self.retention))
            .await
        {
            Ok(()) => metric!(counter("cache.set") += 1, "status" => "ok"),
            Err(err) => self.report("set", key, &err),
        }
    }

    /// Removes the entry at `key`.
    pub async fn remove(&self, key: &str) {
        match self.run("remove", self.backend.remove(key)).await {
            Ok(()) => metric!(counter("cache.remove") += 1, "status" => "ok"),
            Err(err) => self.report("remove", key, &err),
        }
    }

    async fn run<F, T>(&self, operation: &str, future: F) -> Result<T, CacheBackendError>
    where
        F: Future<Output = Result<T, CacheBackendError>>,
    {
        tracing::trace!(backend = self.backend.name(), "Cache {operation}");
        tokio::time::timeout(self.operation_timeout, future)
            .await
            .unwrap_or(Err(CacheBackendError::Timeout(self.operation_timeout)))
    }

    fn report(&self, operation: &str, key: &str, err: &CacheBackendError) {
        metric!(
            counter(&format!("cache.{operation}")) += 1,
            "status" => "error",
            "errdetails" => err.as_tag(),
        );
        tracing::debug!(
            error = err as &dyn std::error::Error,
            key,
            "Cache {operation} failed, continuing without cache",
        );
        self.reporter.report(ErrorReport::cache_backend(
            operation,
            self.backend.name(),
            key,
            err,
        ));
    }
}
