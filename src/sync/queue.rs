//! Sync Job Queue
//!
//! In-process job queue with a bounded worker pool. Jobs are delivered at
//! least once; the dispatcher holds a semaphore permit per active job.
//! A job still running past the lock duration is reported as stalled and
//! left to finish; it is never handed out again.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::SyncRequest;

/// How long a job may run before it is reported as stalled
pub const DEFAULT_JOB_LOCK_DURATION: Duration = Duration::from_secs(600);

/// A queued sync request
#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub request: SyncRequest,
    pub enqueued_at: DateTime<Utc>,
}

/// Job state as exposed for introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Waiting,
    Active,
}

/// Queue depth snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub name: String,
    pub waiting: usize,
    pub active: usize,
    pub stalled: u64,
    pub concurrency: usize,
}

/// Bounded worker-pool queue
pub struct JobQueue {
    name: String,
    concurrency: usize,
    lock_duration: Duration,
    stalled: AtomicU64,
    tx: mpsc::UnboundedSender<SyncJob>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SyncJob>>>,
    waiting: DashMap<Uuid, SyncJob>,
    active: DashMap<Uuid, SyncJob>,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
            lock_duration: DEFAULT_JOB_LOCK_DURATION,
            stalled: AtomicU64::new(0),
            tx,
            rx: Mutex::new(Some(rx)),
            waiting: DashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Jobs that have overrun the lock duration since start
    pub fn stalled_count(&self) -> u64 {
        self.stalled.load(Ordering::SeqCst)
    }

    pub fn push(&self, job: SyncJob) -> Result<()> {
        let id = job.id;
        self.waiting.insert(id, job.clone());
        if self.tx.send(job).is_err() {
            self.waiting.remove(&id);
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            name: self.name.clone(),
            waiting: self.waiting.len(),
            active: self.active.len(),
            stalled: self.stalled_count(),
            concurrency: self.concurrency,
        }
    }

    pub fn jobs(&self, status: JobStatus) -> Vec<SyncJob> {
        let source = match status {
            JobStatus::Waiting => &self.waiting,
            JobStatus::Active => &self.active,
        };
        let mut jobs: Vec<SyncJob> = source.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by_key(|job| job.enqueued_at);
        jobs
    }

    /// Dispatch jobs to `handler` with at most `concurrency` in flight
    /// until `shutdown` flips. Can only run once per queue.
    pub async fn run<F, Fut>(self: Arc<Self>, handler: F, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        F: Fn(SyncJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal(format!("queue {} already running", self.name)))?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let handler = Arc::new(handler);

        tracing::info!("Queue {} started with concurrency {}", self.name, self.concurrency);

        loop {
            let job = tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            self.waiting.remove(&job.id);
            self.active.insert(job.id, job.clone());

            let queue = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let id = job.id;
                let wallet = job.request.wallet.clone();
                let work = handler(job);
                tokio::pin!(work);

                if tokio::time::timeout(queue.lock_duration, &mut work).await.is_err() {
                    queue.stalled.fetch_add(1, Ordering::SeqCst);
                    tracing::error!(
                        "{} job stalled - ID {} for {} still running after {:?}",
                        queue.name,
                        id,
                        wallet,
                        queue.lock_duration
                    );
                    work.await;
                }

                queue.active.remove(&id);
                drop(permit);
            });
        }

        tracing::info!("Queue {} stopped", self.name);
        Ok(())
    }
}
