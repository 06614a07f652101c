use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use revalidator_service::clock::SystemClock;
use revalidator_service::config::Config;
use revalidator_service::environment::Environment;
use revalidator_service::query::{Query, QueryRegistry, QuerySpec, create_query};
use revalidator_service::queue::{MemoryQueue, RevalidationQueue};
use revalidator_service::reporting::SentryReporter;
use revalidator_service::worker::RevalidationWorker;

use crate::workloads::{SyntheticQuery, WorkloadsConfig};

/// The time given to the worker pool to catch up after the last request.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let queue = Arc::new(MemoryQueue::new(config.queue.max_queue_size));
    let env = Environment::from_config(
        &config,
        queue.clone(),
        Arc::new(SystemClock),
        Arc::new(SentryReporter),
    )
    .context("failed to set up the environment")?;

    let workloads: Vec<_> = workloads
        .workloads
        .iter()
        .enumerate()
        .map(|(i, workload)| {
            let query = create_query(SyntheticQuery::new(i, workload), env.clone());
            (workload.concurrency, workload.keys.max(1), query)
        })
        .collect();

    let mut registry = QueryRegistry::builder();
    for (_, _, query) in &workloads {
        registry = registry.register(query.clone())?;
    }

    let mut worker = RevalidationWorker::new(env.clone(), registry.build(), config.worker.clone());
    worker.ready();
    tracing::info!(workloads = workloads.len(), ?duration, "Starting stresstest");

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, keys, query) in workloads.iter().cloned() {
        let deadline = tokio::time::Instant::now() + duration;

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        let query = query.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let payload = rand::random_range(0..keys);
                        let task_start = Instant::now();

                        let future = async move {
                            if query.execute(&payload).await.is_err() {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }
                            if let Ok(mut durations) = task_durations.lock() {
                                durations.add(task_start.elapsed().as_secs_f64());
                            }
                            drop(permit);
                        };
                        tokio::spawn(future.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations = match task_durations.lock() {
                Ok(mut durations) => std::mem::take(&mut *durations),
                Err(_) => DDSketch::default(),
            };
            (task_durations, errors.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    let settle_start = Instant::now();
    let idle = tokio::time::timeout(SETTLE_TIMEOUT, queue.wait_idle())
        .await
        .is_ok();
    let settle_time = settle_start.elapsed();
    let outstanding = queue.outstanding();
    worker.quit().await;

    for ((concurrency, keys, query), task) in workloads.iter().zip(finished_tasks) {
        let (task_durations, errors) = task.context("workload task panicked")?;
        print_workload(query, *concurrency, *keys, &task_durations, errors, duration);
    }

    println!();
    if idle {
        println!("Revalidation queue drained in {settle_time:.2?}");
    } else {
        println!("Revalidation queue still had {outstanding} jobs after {settle_time:.2?}");
    }

    Ok(())
}

fn print_workload(
    query: &Query<SyntheticQuery>,
    concurrency: usize,
    keys: u64,
    task_durations: &DDSketch,
    errors: usize,
    duration: Duration,
) {
    let name = query.spec().name();
    let ops = task_durations.count();
    let ops_ps = ops as f64 / duration.as_secs_f64();
    println!(
        "Workload {name} (concurrency: {concurrency}, keys: {keys}): {ops} operations, {ops_ps:.2} ops/s, {errors} errors"
    );

    let origin = &query.spec().origin;
    println!(
        "  origin: {} fetches, {} failures",
        origin.fetches(),
        origin.failures()
    );

    if ops == 0 {
        return;
    }
    let quantile = |q| {
        let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs)
    };
    let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
    let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}
