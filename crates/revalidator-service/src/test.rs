//! Test doubles for the revalidation engine.
//!
//! [`TestEnv`] wires an [`Environment`] from an in-memory backend, a [`MemoryQueue`], a
//! [`ManualClock`] and a [`RecordingReporter`], keeping typed handles to all of them. The
//! [`ContentQuery`] and [`UserQuery`] specs fetch from a shared, scriptable [`TestOrigin`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::caching::{
    BackendRef, CacheBackend, CacheBackendError, FreshnessPolicy, MemoryBackend,
};
use crate::clock::ManualClock;
use crate::environment::Environment;
use crate::query::{FetchError, QuerySpec, namespaced_key, strip_namespace};
use crate::queue::MemoryQueue;
use crate::reporting::{ErrorReport, ErrorReporter};

/// An [`ErrorReporter`] that keeps every report in memory.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().unwrap().clone()
    }

    /// The first fingerprint part of every report, in order.
    pub fn categories(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter_map(|report| report.fingerprint.first().cloned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().unwrap().push(report);
    }
}

/// A cache backend that is always down.
#[derive(Debug, Default)]
pub struct UnavailableBackend {
    calls: AtomicUsize,
}

impl UnavailableBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn fail<T>(&self) -> Result<T, CacheBackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(CacheBackendError::Unavailable("connection refused".into()))
    }
}

impl CacheBackend for UnavailableBackend {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheBackendError>> {
        Box::pin(futures::future::ready(self.fail()))
    }

    fn set<'a>(
        &'a self,
        _key: &'a str,
        _value: Bytes,
        _ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheBackendError>> {
        Box::pin(futures::future::ready(self.fail()))
    }

    fn remove<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<(), CacheBackendError>> {
        Box::pin(futures::future::ready(self.fail()))
    }
}

/// A cache backend that never answers.
#[derive(Debug, Default)]
pub struct HangingBackend;

impl CacheBackend for HangingBackend {
    fn name(&self) -> &'static str {
        "hanging"
    }

    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheBackendError>> {
        Box::pin(futures::future::pending())
    }

    fn set<'a>(
        &'a self,
        _key: &'a str,
        _value: Bytes,
        _ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheBackendError>> {
        Box::pin(futures::future::pending())
    }

    fn remove<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<(), CacheBackendError>> {
        Box::pin(futures::future::pending())
    }
}

/// A scriptable origin holding raw values by id.
#[derive(Debug, Default)]
pub struct TestOrigin {
    values: Mutex<BTreeMap<u64, Value>>,
    failure: Mutex<Option<FetchError>>,
    delay: Mutex<Duration>,
    fetches: AtomicUsize,
}

impl TestOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, id: u64, value: Value) {
        self.values.lock().unwrap().insert(id, value);
    }

    /// Makes every following fetch fail with `error`, or succeed again with `None`.
    pub fn fail_with(&self, error: Option<FetchError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// The number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn fetch(&self, id: u64) -> Result<Value, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.values
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: u64,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentPayload {
    pub id: u64,
}

/// A query for content documents, keyed `content:{id}`.
#[derive(Debug)]
pub struct ContentQuery {
    pub origin: Arc<TestOrigin>,
    pub policy: FreshnessPolicy,
}

impl ContentQuery {
    /// Stale after one minute, revalidated in the background.
    pub fn new(origin: Arc<TestOrigin>) -> Self {
        Self {
            origin,
            policy: FreshnessPolicy::new(Duration::from_secs(60)),
        }
    }

    pub fn with_policy(self, policy: FreshnessPolicy) -> Self {
        Self { policy, ..self }
    }
}

impl QuerySpec for ContentQuery {
    type Payload = ContentPayload;
    type Value = Content;

    fn name(&self) -> &'static str {
        "content"
    }

    fn key(&self, payload: &ContentPayload) -> String {
        namespaced_key(self.name(), payload.id)
    }

    fn payload(&self, key: &str) -> Option<ContentPayload> {
        let id = strip_namespace(self.name(), key)?.parse().ok()?;
        Some(ContentPayload { id })
    }

    fn fetch<'a>(
        &'a self,
        payload: &'a ContentPayload,
    ) -> BoxFuture<'a, Result<Value, FetchError>> {
        Box::pin(self.origin.fetch(payload.id))
    }

    fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    fn example_payload(&self) -> ContentPayload {
        ContentPayload { id: 42 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPayload {
    pub id: u64,
}

/// A query for users, keyed `user:{id}`.
#[derive(Debug)]
pub struct UserQuery {
    pub origin: Arc<TestOrigin>,
    pub policy: FreshnessPolicy,
}

impl UserQuery {
    /// Stale after one hour, revalidated in the background.
    pub fn new(origin: Arc<TestOrigin>) -> Self {
        Self {
            origin,
            policy: FreshnessPolicy::new(Duration::from_secs(3600)),
        }
    }

    pub fn with_policy(self, policy: FreshnessPolicy) -> Self {
        Self { policy, ..self }
    }
}

impl QuerySpec for UserQuery {
    type Payload = UserPayload;
    type Value = User;

    fn name(&self) -> &'static str {
        "user"
    }

    fn key(&self, payload: &UserPayload) -> String {
        namespaced_key(self.name(), payload.id)
    }

    fn payload(&self, key: &str) -> Option<UserPayload> {
        let id = strip_namespace(self.name(), key)?.parse().ok()?;
        Some(UserPayload { id })
    }

    fn fetch<'a>(&'a self, payload: &'a UserPayload) -> BoxFuture<'a, Result<Value, FetchError>> {
        Box::pin(self.origin.fetch(payload.id))
    }

    fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    fn example_payload(&self) -> UserPayload {
        UserPayload { id: 7 }
    }
}

/// An [`Environment`] together with typed handles to its parts.
#[derive(Debug, Clone)]
pub struct TestEnv {
    pub env: Environment,
    pub clock: ManualClock,
    pub queue: Arc<MemoryQueue>,
    pub reporter: Arc<RecordingReporter>,
}

impl TestEnv {
    /// An environment over an empty in-memory backend.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new(1_000)))
    }

    pub fn with_backend(backend: BackendRef) -> Self {
        let clock = ManualClock::default();
        let queue = Arc::new(MemoryQueue::new(100));
        let reporter = Arc::new(RecordingReporter::default());
        let env = Environment::new(
            backend,
            queue.clone(),
            Arc::new(clock.clone()),
            reporter.clone(),
        );

        Self {
            env,
            clock,
            queue,
            reporter,
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
