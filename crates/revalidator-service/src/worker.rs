//! The pool of workers refreshing stale entries in the background.
//!
//! A single supervisor task takes [`UpdateJob`]s off the queue and spawns one task per job, with
//! at most `concurrency` of them running at a time. Every job is marked complete on the queue
//! once its task ends, no matter whether it succeeded, failed, timed out or panicked.
//!
//! ### Metrics
//!
//! - `worker.jobs_in_flight`: Gauge of the jobs currently running.
//! - `worker.job`: Finished jobs, tagged with `status`.
//! - `worker.job.duration`: Time spent per job, tagged with `status`.
//! - `worker.job.wait`: Time a job spent in the queue.

use std::time::{Duration, Instant};

use sentry::{Hub, SentryFutureExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::environment::Environment;
use crate::query::{FetchError, QueryRegistry, RevalidationOutcome};
use crate::queue::UpdateJob;
use crate::reporting::ErrorReport;
use crate::utils::defer;

/// Consumes the revalidation queue of an [`Environment`].
///
/// Jobs are only processed between [`ready`](Self::ready) and [`quit`](Self::quit).
#[derive(Debug)]
pub struct RevalidationWorker {
    env: Environment,
    registry: QueryRegistry,
    config: WorkerConfig,
    shutdown: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl RevalidationWorker {
    pub fn new(env: Environment, registry: QueryRegistry, config: WorkerConfig) -> Self {
        Self {
            env,
            registry,
            config,
            shutdown: CancellationToken::new(),
            supervisor: None,
        }
    }

    /// Starts processing jobs.
    ///
    /// Queries whose keys can not be mapped back to their payload are reported, their jobs will
    /// fail with [`RevalidationOutcome::UnknownKey`]. Calling this more than once has no effect.
    pub fn ready(&mut self) {
        if self.supervisor.is_some() {
            return;
        }

        for name in self.registry.check_roundtrips() {
            self.env.reporter.report(ErrorReport::key_roundtrip(name));
        }

        let supervisor = supervise(
            self.env.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        );
        self.supervisor = Some(tokio::spawn(
            supervisor.bind_hub(Hub::new_from_top(Hub::current())),
        ));
        tracing::info!(
            concurrency = self.config.concurrency,
            queries = self.registry.len(),
            "Revalidation worker started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .as_ref()
            .is_some_and(|supervisor| !supervisor.is_finished())
    }

    /// Stops taking new jobs, waits for the running ones and closes the queue.
    ///
    /// Jobs still waiting in the queue are discarded and their keys released.
    pub async fn quit(mut self) {
        self.shutdown.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Revalidation supervisor failed"
                );
            }
        }
        self.env.queue.close();
        tracing::info!("Revalidation worker terminated");
    }
}

impl Drop for RevalidationWorker {
    fn drop(&mut self) {
        // The supervisor stops admitting jobs, running ones finish on their own.
        self.shutdown.cancel();
    }
}

async fn supervise(
    env: Environment,
    registry: QueryRegistry,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    let concurrency = config.concurrency.max(1);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(concurrency);
    let mut free_slots = concurrency;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            Some(_) = done_rx.recv() => {
                free_slots += 1;
                metric!(gauge("worker.jobs_in_flight") = (concurrency - free_slots) as u64);
            }
            job = env.queue.dequeue(), if free_slots > 0 => {
                let Some(job) = job else {
                    tracing::debug!("Revalidation queue closed");
                    break;
                };
                free_slots -= 1;
                tokio::spawn(
                    run_job(env.clone(), registry.clone(), job, config.job_timeout, done_tx.clone())
                        .bind_hub(Hub::new_from_top(Hub::current())),
                );
                metric!(gauge("worker.jobs_in_flight") = (concurrency - free_slots) as u64);
            }
        }
    }

    // Every job task signals exactly once, even when it panics.
    while free_slots < concurrency && done_rx.recv().await.is_some() {
        free_slots += 1;
    }
    metric!(gauge("worker.jobs_in_flight") = 0);
}

/// Processes a single job and releases its slot and key afterwards.
async fn run_job(
    env: Environment,
    registry: QueryRegistry,
    job: UpdateJob,
    job_timeout: Duration,
    done_tx: mpsc::Sender<()>,
) {
    let _release_slot = defer(move || {
        // The channel has room for every slot, this only fails once the supervisor is gone.
        done_tx.try_send(()).ok();
    });
    let _complete = defer({
        let queue = env.queue.clone();
        let job = job.clone();
        move || queue.complete(&job)
    });

    metric!(timer("worker.job.wait") = job.enqueued_at.elapsed());

    let start = Instant::now();
    let outcome = process_job(&env, &registry, &job.key, job_timeout).await;
    metric!(
        timer("worker.job.duration") = start.elapsed(),
        "status" => outcome.as_ref(),
    );
    metric!(counter("worker.job") += 1, "status" => outcome.as_ref());
    tracing::debug!(key = job.key.as_str(), status = outcome.as_ref(), "Revalidation finished");
}

/// Revalidates `key` with the query that owns it.
///
/// Running out of time is handled like a failed origin fetch: reported, with the cached entry
/// left untouched.
pub async fn process_job(
    env: &Environment,
    registry: &QueryRegistry,
    key: &str,
    job_timeout: Duration,
) -> RevalidationOutcome {
    let Some(query) = registry.resolve(key) else {
        env.reporter.report(ErrorReport::unknown_key(key));
        return RevalidationOutcome::UnknownKey;
    };

    match tokio::time::timeout(job_timeout, query.revalidate(key)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let error = FetchError::Timeout(job_timeout);
            tracing::debug!(key, "Revalidation timed out");
            env.reporter
                .report(ErrorReport::origin_fetch(query.name(), key, &error));
            RevalidationOutcome::FetchFailed
        }
    }
}
