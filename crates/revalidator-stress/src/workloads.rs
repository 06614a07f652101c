use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

use revalidator_service::caching::FreshnessPolicy;
use revalidator_service::query::{FetchError, QuerySpec, namespaced_key, strip_namespace};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct payloads requested, uniformly at random.
    pub keys: u64,
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<Duration>,
    #[serde(default = "default_swr")]
    pub swr: bool,
    #[serde(default)]
    pub origin: OriginConfig,
}

fn default_swr() -> bool {
    true
}

/// Behavior of the simulated origin.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OriginConfig {
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Fraction of fetches answered with a 503.
    pub failure_rate: f32,
    /// Fraction of fetches answered with a value of the wrong shape.
    pub invalid_rate: f32,
}

/// A simulated origin counting what it was asked to do.
#[derive(Debug, Default)]
pub struct SyntheticOrigin {
    config: OriginConfig,
    fetches: AtomicUsize,
    failures: AtomicUsize,
}

impl SyntheticOrigin {
    pub fn new(config: OriginConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    async fn fetch(&self, id: u64) -> Result<serde_json::Value, FetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        let roll = rand::random::<f32>();
        if roll < self.config.failure_rate {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(FetchError::Status(503));
        }
        if roll < self.config.failure_rate + self.config.invalid_rate {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Ok(json!({ "id": id.to_string() }));
        }

        Ok(json!({ "id": id, "revision": self.fetches() }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    pub revision: usize,
}

/// The query of one workload, keyed `{name}:{id}`.
#[derive(Debug)]
pub struct SyntheticQuery {
    name: &'static str,
    policy: FreshnessPolicy,
    pub origin: Arc<SyntheticOrigin>,
}

impl SyntheticQuery {
    pub fn new(index: usize, workload: &Workload) -> Self {
        // Query names are static, and there is a fixed handful of workloads per process.
        let name = format!("workload{index}").leak();

        let mut policy = FreshnessPolicy::new(workload.stale_after);
        if let Some(max_age) = workload.max_age {
            policy = policy.with_max_age(max_age);
        }
        if !workload.swr {
            policy = policy.without_swr();
        }

        Self {
            name,
            policy,
            origin: Arc::new(SyntheticOrigin::new(workload.origin.clone())),
        }
    }
}

impl QuerySpec for SyntheticQuery {
    type Payload = u64;
    type Value = Document;

    fn name(&self) -> &'static str {
        self.name
    }

    fn key(&self, payload: &u64) -> String {
        namespaced_key(self.name, payload)
    }

    fn payload(&self, key: &str) -> Option<u64> {
        strip_namespace(self.name, key)?.parse().ok()
    }

    fn fetch<'a>(&'a self, payload: &'a u64) -> BoxFuture<'a, Result<serde_json::Value, FetchError>> {
        Box::pin(self.origin.fetch(*payload))
    }

    fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    fn example_payload(&self) -> u64 {
        0
    }
}
