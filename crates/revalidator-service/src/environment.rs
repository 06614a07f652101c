use anyhow::Result;

use crate::caching::{BackendRef, Cache};
use crate::clock::ClockRef;
use crate::config::Config;
use crate::queue::QueueRef;
use crate::reporting::ReporterRef;

/// Everything a [`Query`](crate::query::Query) and the
/// [`RevalidationWorker`](crate::worker::RevalidationWorker) share.
///
/// All parts are injected, so tests can substitute in-memory or failing implementations and
/// control time through the clock.
#[derive(Debug, Clone)]
pub struct Environment {
    pub cache: Cache,
    pub queue: QueueRef,
    pub clock: ClockRef,
    pub reporter: ReporterRef,
}

impl Environment {
    /// Creates an environment with a default configured [`Cache`] over `backend`.
    pub fn new(backend: BackendRef, queue: QueueRef, clock: ClockRef, reporter: ReporterRef) -> Self {
        let cache = Cache::new(backend, clock.clone(), reporter.clone());
        Self {
            cache,
            queue,
            clock,
            reporter,
        }
    }

    /// Creates the configured cache in front of `queue`.
    pub fn from_config(
        config: &Config,
        queue: QueueRef,
        clock: ClockRef,
        reporter: ReporterRef,
    ) -> Result<Self> {
        let cache = Cache::from_config(&config.cache, clock.clone(), reporter.clone())?;
        Ok(Self {
            cache,
            queue,
            clock,
            reporter,
        })
    }
}
