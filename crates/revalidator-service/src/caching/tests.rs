use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::clock::{Clock, ManualClock};
use crate::test::{HangingBackend, RecordingReporter, UnavailableBackend, User};

use super::*;

fn user(username: &str) -> User {
    User {
        username: username.into(),
    }
}

fn cache_over(backend: BackendRef) -> (Cache, ManualClock, Arc<RecordingReporter>) {
    let clock = ManualClock::default();
    let reporter = Arc::new(RecordingReporter::default());
    let cache = Cache::new(backend, Arc::new(clock.clone()), reporter.clone());
    (cache, clock, reporter)
}

#[test]
fn test_classify() {
    let policy = FreshnessPolicy::new(Duration::from_secs(60));
    assert_eq!(policy.classify(Duration::ZERO), Freshness::Fresh);
    assert_eq!(policy.classify(Duration::from_secs(59)), Freshness::Fresh);
    assert_eq!(policy.classify(Duration::from_secs(60)), Freshness::Stale);
    // Without a max age, a value never expires.
    assert_eq!(
        policy.classify(Duration::from_secs(365 * 24 * 3600)),
        Freshness::Stale
    );

    let policy = policy.with_max_age(Duration::from_secs(120));
    assert_eq!(policy.classify(Duration::from_secs(119)), Freshness::Stale);
    assert_eq!(policy.classify(Duration::from_secs(120)), Freshness::Expired);
}

#[test]
fn test_max_age_below_stale_after() {
    let policy =
        FreshnessPolicy::new(Duration::from_secs(60)).with_max_age(Duration::from_secs(30));
    assert_eq!(policy.classify(Duration::from_secs(10)), Freshness::Fresh);
    assert_eq!(policy.classify(Duration::from_secs(30)), Freshness::Expired);
}

#[test]
fn test_missing_entry_is_expired() {
    let policy = FreshnessPolicy::new(Duration::from_secs(60));
    let now = ManualClock::default().now();
    assert_eq!(policy.freshness_of::<User>(None, now), Freshness::Expired);
}

#[tokio::test]
async fn test_roundtrip_with_timestamp() {
    revalidator_test::setup();
    let (cache, clock, reporter) = cache_over(Arc::new(MemoryBackend::new(100)));
    let stored_at = clock.now();

    cache.set("user:1", &user("Alice"), Some("user 1")).await;
    clock.advance(Duration::from_secs(90));

    let entry = cache.get::<User>("user:1").await.unwrap();
    assert_eq!(entry.value, user("Alice"));
    assert_eq!(entry.stored_at, stored_at);
    assert_eq!(entry.source.as_deref(), Some("user 1"));
    assert_eq!(entry.age(clock.now()), Duration::from_secs(90));

    cache.remove("user:1").await;
    assert!(cache.get::<User>("user:1").await.is_none());
    assert_eq!(reporter.count(), 0);
}

#[tokio::test]
async fn test_unavailable_backend() {
    revalidator_test::setup();
    let backend = Arc::new(UnavailableBackend::default());
    let (cache, _clock, reporter) = cache_over(backend.clone());

    assert!(cache.get::<User>("user:1").await.is_none());
    cache.set("user:1", &user("Alice"), None).await;
    cache.remove("user:1").await;

    assert_eq!(backend.calls(), 3);
    let reports = reporter.reports();
    let fingerprints: Vec<_> = reports.iter().map(|r| r.fingerprint.join("/")).collect();
    assert_eq!(
        fingerprints,
        ["cache-backend/get", "cache-backend/set", "cache-backend/remove"]
    );
    assert_eq!(reports[0].context["key"], "user:1");
    assert_eq!(reports[0].context["backend"], "unavailable");
    assert_eq!(
        reports[0].context["failureReason"],
        "cache backend unavailable: connection refused"
    );
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    revalidator_test::setup();
    let (cache, _clock, reporter) = cache_over(Arc::new(HangingBackend));
    let cache = cache.with_operation_timeout(Duration::from_millis(10));

    assert!(cache.get::<User>("user:1").await.is_none());
    cache.set("user:1", &user("Alice"), None).await;

    let reports = reporter.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(
        reports[0].context["failureReason"],
        "cache backend timed out after 10ms"
    );
}

#[tokio::test]
async fn test_malformed_entry_is_a_miss() {
    revalidator_test::setup();
    let backend = Arc::new(MemoryBackend::new(100));
    let (cache, _clock, reporter) = cache_over(backend.clone());

    backend
        .set("user:1", Bytes::from_static(b"{\"value\":"), None)
        .await
        .unwrap();
    assert!(cache.get::<User>("user:1").await.is_none());

    // A value of the wrong shape is just as unusable.
    cache.set("user:2", &42, None).await;
    assert!(cache.get::<User>("user:2").await.is_none());

    assert_eq!(
        reporter.categories(),
        vec!["cache-backend", "cache-backend"]
    );
}

#[tokio::test]
async fn test_memory_backend_retention() {
    revalidator_test::setup();
    let backend = MemoryBackend::new(100);

    backend
        .set("kept", Bytes::from_static(b"kept"), None)
        .await
        .unwrap();
    backend
        .set("short", Bytes::from_static(b"short"), Some(Duration::from_millis(10)))
        .await
        .unwrap();
    assert!(backend.get("short").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.get("short").await.unwrap().is_none());
    assert_eq!(
        backend.get("kept").await.unwrap().as_deref(),
        Some(&b"kept"[..])
    );
}

#[tokio::test]
async fn test_filesystem_backend() {
    revalidator_test::setup();
    let cache_dir = revalidator_test::tempdir();
    let backend = FilesystemBackend::new(cache_dir.path());

    assert!(backend.get("user:1").await.unwrap().is_none());

    backend
        .set("user:1", Bytes::from_static(b"first"), None)
        .await
        .unwrap();
    backend
        .set("user:1", Bytes::from_static(b"second"), None)
        .await
        .unwrap();
    assert_eq!(
        backend.get("user:1").await.unwrap().as_deref(),
        Some(&b"second"[..])
    );

    backend.remove("user:1").await.unwrap();
    assert!(backend.get("user:1").await.unwrap().is_none());
    // Removing twice is fine.
    backend.remove("user:1").await.unwrap();
}

#[tokio::test]
async fn test_filesystem_backend_expiry() {
    revalidator_test::setup();
    let cache_dir = revalidator_test::tempdir();
    let backend = FilesystemBackend::new(cache_dir.path());

    backend
        .set("user:1", Bytes::from_static(b"gone"), Some(Duration::ZERO))
        .await
        .unwrap();
    assert!(backend.get("user:1").await.unwrap().is_none());

    backend
        .set("user:2", Bytes::from_static(b"kept"), Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert!(backend.get("user:2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_filesystem_cache_from_config() {
    revalidator_test::setup();
    let cache_dir = revalidator_test::tempdir();
    let config = CacheConfig {
        backend: CacheBackendConfig {
            kind: CacheBackendKind::Filesystem(FilesystemCacheConfig {
                path: cache_dir.path().join("entries"),
            }),
        },
        ..Default::default()
    };
    let clock = Arc::new(ManualClock::default());
    let reporter = Arc::new(RecordingReporter::default());

    let cache = Cache::from_config(&config, clock, reporter.clone()).unwrap();
    assert_eq!(cache.backend().name(), "filesystem");
    assert!(cache_dir.path().join("entries").is_dir());

    cache.set("user:1", &user("Alice"), None).await;
    let entry = cache.get::<User>("user:1").await.unwrap();
    assert_eq!(entry.value, user("Alice"));
    assert_eq!(reporter.count(), 0);
}
