//! The queue of keys waiting for a background revalidation.
//!
//! A key is *outstanding* from the moment it is enqueued until its job is
//! [`complete`](RevalidationQueue::complete)d, including the time a worker spends on it.
//! Enqueueing an outstanding key is a no-op, so there is at most one unit of work per key.
//!
//! ### Metrics
//!
//! - `queue.enqueue`: tagged with `status` `queued`, `coalesced` or `dropped`.
//! - `queue.outstanding`: Gauge of the number of outstanding keys.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

/// A unit of background revalidation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateJob {
    pub key: String,
    pub enqueued_at: Instant,
}

impl UpdateJob {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            enqueued_at: Instant::now(),
        }
    }
}

/// What happened to an enqueued key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// A new job was queued.
    Queued,
    /// A job for the key is already queued or being processed.
    Coalesced,
    /// The queue is full or closed, the key was not queued.
    Dropped,
}

impl AsRef<str> for EnqueueStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Coalesced => "coalesced",
            Self::Dropped => "dropped",
        }
    }
}

/// A de-duplicating queue of [`UpdateJob`]s.
pub trait RevalidationQueue: fmt::Debug + Send + Sync {
    /// Submits a job for `key` without waiting for anything.
    fn enqueue(&self, key: &str) -> EnqueueStatus;

    /// Waits for the next job.
    ///
    /// Resolves to `None` once the queue is closed and drained.
    fn dequeue(&self) -> BoxFuture<'_, Option<UpdateJob>>;

    /// Marks `job` as done, after which its key may be queued again.
    fn complete(&self, job: &UpdateJob);

    /// Stops accepting new jobs and discards the ones not yet dequeued.
    ///
    /// Jobs that were already dequeued stay outstanding until they are completed.
    fn close(&self);

    fn is_outstanding(&self, key: &str) -> bool;

    /// The number of jobs queued or being processed.
    fn outstanding(&self) -> usize;
}

pub type QueueRef = Arc<dyn RevalidationQueue>;

/// An in-process [`RevalidationQueue`] backed by a bounded channel.
pub struct MemoryQueue {
    tx: Mutex<Option<mpsc::Sender<UpdateJob>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<UpdateJob>>,
    outstanding: Mutex<HashSet<String>>,
    outstanding_count: watch::Sender<usize>,
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl MemoryQueue {
    /// Creates a queue holding at most `max_queue_size` jobs that are not yet being processed.
    pub fn new(max_queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_queue_size.max(1));
        let (outstanding_count, _) = watch::channel(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            outstanding: Mutex::new(HashSet::new()),
            outstanding_count,
        }
    }

    /// Resolves once no job is outstanding anymore.
    pub async fn wait_idle(&self) {
        let mut count = self.outstanding_count.subscribe();
        // The sender lives in `self`, so this can not fail.
        count.wait_for(|count| *count == 0).await.ok();
    }

    fn publish(&self, outstanding: usize) {
        self.outstanding_count.send_replace(outstanding);
        metric!(gauge("queue.outstanding") = outstanding as u64);
    }

    fn try_enqueue(&self, key: &str) -> EnqueueStatus {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        if outstanding.contains(key) {
            return EnqueueStatus::Coalesced;
        }

        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            tracing::debug!(key, "Revalidation queue is closed, dropping job");
            return EnqueueStatus::Dropped;
        };

        match tx.try_send(UpdateJob::new(key)) {
            Ok(()) => {
                outstanding.insert(key.to_owned());
                self.publish(outstanding.len());
                EnqueueStatus::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(key, "Revalidation queue is full, dropping job");
                EnqueueStatus::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(key, "Revalidation queue is closed, dropping job");
                EnqueueStatus::Dropped
            }
        }
    }
}

impl RevalidationQueue for MemoryQueue {
    fn enqueue(&self, key: &str) -> EnqueueStatus {
        let status = self.try_enqueue(key);
        metric!(counter("queue.enqueue") += 1, "status" => status.as_ref());
        status
    }

    fn dequeue(&self) -> BoxFuture<'_, Option<UpdateJob>> {
        Box::pin(async move { self.rx.lock().await.recv().await })
    }

    fn complete(&self, job: &UpdateJob) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        if outstanding.remove(&job.key) {
            self.publish(outstanding.len());
        }
    }

    fn close(&self) {
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.take().is_some() {
            tracing::debug!("Closed revalidation queue");
        }
        drop(tx);

        // A pending `dequeue` holds the receiver only while the channel is empty.
        let Ok(mut rx) = self.rx.try_lock() else {
            return;
        };
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        let mut discarded = 0;
        while let Ok(job) = rx.try_recv() {
            outstanding.remove(&job.key);
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded queued revalidation jobs");
            self.publish(outstanding.len());
        }
    }

    fn is_outstanding(&self, key: &str) -> bool {
        let outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        outstanding.contains(key)
    }

    fn outstanding(&self) -> usize {
        *self.outstanding_count.borrow()
    }
}
