//! Process-wide serializer for work that must own the shared transmitter.
//!
//! Any node, in any flow, submits transmitter work as a job. Jobs run one
//! at a time in arrival order; a failing job only rejects its own handle.

use crate::error::panic_message;
use crate::BroadcastJobError;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Who asked for the transmitter, and for which channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastMetadata {
    pub origin: String,
    pub channel: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl BroadcastMetadata {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            channel: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: usize,
    pub processing: bool,
}

struct BroadcastJob {
    metadata: BroadcastMetadata,
    work: BoxFuture<'static, Result<(), BroadcastJobError>>,
}

struct QueueState {
    jobs: VecDeque<BroadcastJob>,
    /// Set while a drain task owns the queue
    processing: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    job_timeout: Option<Duration>,
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap-to-clone handle onto one shared FIFO
#[derive(Clone)]
pub struct BroadcastQueue {
    shared: Arc<Shared>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::with_job_timeout(None)
    }

    /// A queue that abandons any job running longer than `job_timeout`
    pub fn with_job_timeout(job_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    processing: false,
                }),
                job_timeout,
                enqueued: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Append a job. The returned handle resolves once `work` has run to
    /// completion behind every job enqueued before it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue<F, T>(&self, metadata: BroadcastMetadata, work: F) -> BroadcastHandle<T>
    where
        F: Future<Output = Result<T, BroadcastJobError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job_timeout = self.shared.job_timeout;

        let work = async move {
            let guarded = AssertUnwindSafe(work).catch_unwind();
            let outcome = match job_timeout {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(Err(BroadcastJobError::TimedOut(limit))),
                },
                None => guarded.await,
            };
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(BroadcastJobError::Panicked(panic_message(&*panic))),
            };
            let status = result.as_ref().map(|_| ()).map_err(|e| e.clone());
            // Caller may have stopped waiting
            let _ = tx.send(result);
            status
        }
        .boxed();

        let job = BroadcastJob {
            metadata: metadata.clone(),
            work,
        };

        let start_drain = {
            let mut state = self.shared.state();
            state.jobs.push_back(job);
            let idle = !state.processing;
            state.processing = true;
            idle
        };
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(origin = %metadata.origin, channel = ?metadata.channel, "broadcast job enqueued");

        if start_drain {
            tokio::spawn(drain(self.shared.clone()));
        }

        BroadcastHandle { metadata, receiver: rx }
    }

    pub fn stats(&self) -> BroadcastStats {
        let (pending, processing) = {
            let state = self.shared.state();
            (state.jobs.len(), state.processing)
        };
        BroadcastStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            pending,
            processing,
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state();
        state.jobs.is_empty() && !state.processing
    }
}

impl Default for BroadcastQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state();
            match state.jobs.pop_front() {
                Some(job) => job,
                None => {
                    state.processing = false;
                    return;
                }
            }
        };

        let waited_ms = (Utc::now() - job.metadata.enqueued_at).num_milliseconds();
        tracing::debug!(origin = %job.metadata.origin, waited_ms, "broadcast job running");

        match job.work.await {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    origin = %job.metadata.origin,
                    channel = ?job.metadata.channel,
                    "broadcast job failed: {}",
                    e
                );
            }
        }
    }
}

/// Caller's side of a queued job
pub struct BroadcastHandle<T> {
    metadata: BroadcastMetadata,
    receiver: oneshot::Receiver<Result<T, BroadcastJobError>>,
}

impl<T> BroadcastHandle<T> {
    pub fn metadata(&self) -> &BroadcastMetadata {
        &self.metadata
    }

    pub async fn wait(self) -> Result<T, BroadcastJobError> {
        self.receiver.await.unwrap_or(Err(BroadcastJobError::Dropped))
    }
}
