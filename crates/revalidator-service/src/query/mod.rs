//! Cached, automatically revalidated queries.
//!
//! A [`QuerySpec`] is the static description of one kind of origin operation, a [`Query`] is the
//! runtime accessor built from it by [`create_query`].
//!
//! On [`Query::execute`], the cached entry for the payload's key is classified by the query's
//! [`FreshnessPolicy`]:
//!
//! - Fresh entries are returned without any side effects.
//! - Stale entries of queries with `enable_swr` are returned right away, after submitting an
//!   [`UpdateJob`](crate::queue::UpdateJob) for the key to the revalidation queue.
//! - Everything else (expired, stale without SWR, or a miss) is fetched from the origin
//!   synchronously. A fetch or decode failure is reported, and the old entry is served if there
//!   is one. Only without any cached value does the caller see a [`QueryError`].
//!
//! ### Metrics
//!
//! - `query.access`: All executions, tagged with the query name.
//! - `query.fresh` / `query.stale`: Executions served from the cache.
//! - `query.sync_fetch`: Executions that had to wait for the origin.
//! - `query.fallback`: Failed synchronous fetches that were served an old value, tagged with
//!   `errdetails`.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::{Deserialize, DeserializeOwned};

use crate::caching::{CacheEntry, Freshness, FreshnessPolicy};
use crate::environment::Environment;
use crate::queue::EnqueueStatus;
use crate::reporting::{ErrorReport, ErrorReporter, RefreshPath};

mod error;
mod registry;

pub use error::{FetchError, QueryError, RefreshError};
pub use registry::{QueryRegistry, QueryRegistryBuilder, RegistryError, Revalidate};

/// Separates the query name from the rest of a cache key.
pub const KEY_SEPARATOR: char = ':';

/// Builds a cache key in the namespace of the query `name`.
pub fn namespaced_key(name: &str, rest: impl fmt::Display) -> String {
    format!("{name}{KEY_SEPARATOR}{rest}")
}

/// Returns the part of `key` after the namespace of the query `name`.
pub fn strip_namespace<'a>(name: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(name)?.strip_prefix(KEY_SEPARATOR)
}

/// Static description of one cacheable origin operation.
///
/// [`key`](Self::key) and [`payload`](Self::payload) must be inverse to each other:
/// `payload(&key(p)) == Some(p)` for every payload. This is what allows the revalidation worker
/// to recover a payload from nothing but a queued key. Keys should be built with
/// [`namespaced_key`] so that the worker can find the owning query quickly.
pub trait QuerySpec: Send + Sync + 'static {
    type Payload: Clone + fmt::Debug + PartialEq + Send + Sync + 'static;
    type Value: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The namespace of the keys of this query.
    fn name(&self) -> &'static str;

    /// Derives the cache key of `payload`.
    ///
    /// This must be deterministic, equal payloads have to produce equal keys.
    fn key(&self, payload: &Self::Payload) -> String;

    /// Recovers the payload from a key produced by [`key`](Self::key).
    fn payload(&self, key: &str) -> Option<Self::Payload>;

    /// Fetches the raw current value of `payload` from the origin.
    fn fetch<'a>(
        &'a self,
        payload: &'a Self::Payload,
    ) -> BoxFuture<'a, Result<serde_json::Value, FetchError>>;

    /// Validates a raw origin value.
    fn decode(&self, raw: &serde_json::Value) -> Result<Self::Value, serde_json::Error> {
        Self::Value::deserialize(raw)
    }

    fn policy(&self) -> FreshnessPolicy;

    /// A representative payload, used to check the key round-trip.
    fn example_payload(&self) -> Self::Payload;

    /// A hint stored alongside fetched values to tell where they came from.
    fn source_hint(&self, payload: &Self::Payload) -> Option<String> {
        Some(namespaced_key(self.name(), format_args!("{payload:?}")))
    }
}

/// The result of revalidating a single key in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationOutcome {
    /// A new value was fetched and stored.
    Refreshed,
    /// Another writer refreshed the key since the job was queued.
    AlreadyFresh,
    /// The origin failed, the old value was kept.
    FetchFailed,
    /// The origin returned an invalid value, the old value was kept.
    InvalidValue,
    /// The key could not be mapped back to a payload.
    UnknownKey,
}

impl AsRef<str> for RevalidationOutcome {
    fn as_ref(&self) -> &str {
        match self {
            Self::Refreshed => "ok",
            Self::AlreadyFresh => "already_fresh",
            Self::FetchFailed => "fetch_error",
            Self::InvalidValue => "invalid_value",
            Self::UnknownKey => "unknown_key",
        }
    }
}

/// A cached accessor for the operation described by `S`.
pub struct Query<S: QuerySpec> {
    spec: Arc<S>,
    env: Environment,
}

impl<S: QuerySpec> Clone for Query<S> {
    fn clone(&self) -> Self {
        Self {
            spec: Arc::clone(&self.spec),
            env: self.env.clone(),
        }
    }
}

impl<S: QuerySpec> fmt::Debug for Query<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("name", &self.spec.name())
            .field("policy", &self.spec.policy())
            .field("env", &self.env)
            .finish()
    }
}

/// Turns `spec` into a cached accessor using the shared `env`.
pub fn create_query<S: QuerySpec>(spec: S, env: Environment) -> Query<S> {
    Query {
        spec: Arc::new(spec),
        env,
    }
}

impl<S: QuerySpec> Query<S> {
    pub fn spec(&self) -> &S {
        &self.spec
    }

    /// Returns the value for `payload`, from the cache if possible.
    pub async fn execute(&self, payload: &S::Payload) -> Result<S::Value, QueryError> {
        let name = self.spec.name();
        metric!(counter("query.access") += 1, "query" => name);

        let key = self.spec.key(payload);
        let entry = self.env.cache.get::<S::Value>(&key).await;
        let policy = self.spec.policy();

        match (policy.freshness_of(entry.as_ref(), self.env.clock.now()), entry) {
            (Freshness::Fresh, Some(entry)) => {
                metric!(counter("query.fresh") += 1, "query" => name);
                tracing::trace!(key, "Serving fresh value");
                Ok(entry.value)
            }
            (Freshness::Stale, Some(entry)) if policy.enable_swr => {
                metric!(counter("query.stale") += 1, "query" => name);
                match self.env.queue.enqueue(&key) {
                    EnqueueStatus::Queued => tracing::debug!(key, "Queued revalidation"),
                    EnqueueStatus::Coalesced => {
                        tracing::trace!(key, "Revalidation already outstanding")
                    }
                    // the queue already logged this, the stale value is still good to serve
                    EnqueueStatus::Dropped => {}
                }
                Ok(entry.value)
            }
            (_, entry) => self.refresh(&key, payload, entry).await,
        }
    }

    /// Fetches synchronously, falling back to `fallback` on failure.
    async fn refresh(
        &self,
        key: &str,
        payload: &S::Payload,
        fallback: Option<CacheEntry<S::Value>>,
    ) -> Result<S::Value, QueryError> {
        let name = self.spec.name();
        metric!(counter("query.sync_fetch") += 1, "query" => name);
        tracing::debug!(key, "Fetching current value");

        match fetch_current(&*self.spec, payload).await {
            Ok(value) => {
                let source = self.spec.source_hint(payload);
                self.env.cache.set(key, &value, source.as_deref()).await;
                Ok(value)
            }
            Err(err) => {
                report_refresh_error(&*self.env.reporter, RefreshPath::Request, name, key, &err);
                match fallback {
                    Some(entry) => {
                        metric!(
                            counter("query.fallback") += 1,
                            "query" => name,
                            "errdetails" => err.as_tag(),
                        );
                        Ok(entry.value)
                    }
                    None => Err(err.into()),
                }
            }
        }
    }

    /// Refreshes the cached value of a queued `key`.
    ///
    /// Failures are reported, but never touch the existing entry.
    pub async fn revalidate_key(&self, key: &str) -> RevalidationOutcome {
        let Some(payload) = self.spec.payload(key) else {
            self.env.reporter.report(ErrorReport::unknown_key(key));
            return RevalidationOutcome::UnknownKey;
        };

        // A synchronous fetch or another worker may have been faster.
        if let Some(entry) = self.env.cache.get::<S::Value>(key).await {
            let freshness = self.spec.policy().classify(entry.age(self.env.clock.now()));
            if freshness == Freshness::Fresh {
                tracing::trace!(key, "Skipping revalidation of fresh value");
                return RevalidationOutcome::AlreadyFresh;
            }
        }

        match fetch_current(&*self.spec, &payload).await {
            Ok(value) => {
                let source = self.spec.source_hint(&payload);
                self.env.cache.set(key, &value, source.as_deref()).await;
                RevalidationOutcome::Refreshed
            }
            Err(err) => {
                report_refresh_error(
                    &*self.env.reporter,
                    RefreshPath::Background,
                    self.spec.name(),
                    key,
                    &err,
                );
                match err {
                    RefreshError::Fetch(_) => RevalidationOutcome::FetchFailed,
                    RefreshError::InvalidValue { .. } => RevalidationOutcome::InvalidValue,
                }
            }
        }
    }

    /// Checks that the example payload survives the trip through its key.
    pub fn check_key_roundtrip(&self) -> bool {
        let payload = self.spec.example_payload();
        self.spec.payload(&self.spec.key(&payload)).as_ref() == Some(&payload)
    }
}

/// Fetches and validates the current value of `payload`.
async fn fetch_current<S: QuerySpec>(
    spec: &S,
    payload: &S::Payload,
) -> Result<S::Value, RefreshError> {
    let raw = spec.fetch(payload).await?;
    spec.decode(&raw)
        .map_err(|error| RefreshError::InvalidValue { raw, error })
}

fn report_refresh_error(
    reporter: &dyn ErrorReporter,
    path: RefreshPath,
    query: &str,
    key: &str,
    err: &RefreshError,
) {
    let report = match err {
        RefreshError::Fetch(error) => {
            tracing::debug!(key, error = error as &dyn std::error::Error, "Origin fetch failed");
            ErrorReport::origin_fetch(query, key, error)
        }
        RefreshError::InvalidValue { raw, error } => {
            tracing::debug!(key, error = error as &dyn std::error::Error, "Invalid origin value");
            ErrorReport::invalid_value(path, query, key, raw, error)
        }
    };
    reporter.report(report);
}
