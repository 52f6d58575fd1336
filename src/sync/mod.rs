//! Sync Module
//!
//! Deduplicated sync requests flowing through separate manual and
//! recurring worker pools. Each job is monitored to completion and
//! re-enqueued when the secondary is still behind.

mod dedup;
mod monitor;
mod queue;

pub use dedup::{DedupKey, SyncDeduplicator, SyncJobHandle};
pub use monitor::{MonitorSettings, SyncMonitor, SyncOutcome};
pub use queue::{JobQueue, JobStatus, QueueDepth, SyncJob};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::model::{SyncRequest, SyncType};
use crate::peer::{PeerClient, SyncPayload};

/// Poll interval while waiting on a manual sync
const MANUAL_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Jobs across both queues, keyed by status
#[derive(Debug, Clone, Serialize)]
pub struct SyncQueueJobs {
    pub manual_waiting: Vec<SyncJob>,
    pub manual_active: Vec<SyncJob>,
    pub recurring_waiting: Vec<SyncJob>,
    pub recurring_active: Vec<SyncJob>,
}

/// Front door for sync requests
pub struct SyncScheduler {
    dedup: SyncDeduplicator,
    manual: Arc<JobQueue>,
    recurring: Arc<JobQueue>,
    monitor: Arc<SyncMonitor>,
    client: Arc<dyn PeerClient>,
    self_endpoint: String,
    manual_syncs_disabled: bool,
}

impl SyncScheduler {
    pub fn new(
        monitor: Arc<SyncMonitor>,
        client: Arc<dyn PeerClient>,
        self_endpoint: impl Into<String>,
        manual_concurrency: usize,
        recurring_concurrency: usize,
        manual_syncs_disabled: bool,
    ) -> Self {
        Self {
            dedup: SyncDeduplicator::new(),
            manual: Arc::new(JobQueue::new("manual-sync", manual_concurrency)),
            recurring: Arc::new(JobQueue::new("recurring-sync", recurring_concurrency)),
            monitor,
            client,
            self_endpoint: self_endpoint.into(),
            manual_syncs_disabled,
        }
    }

    /// Report jobs running longer than `lock_duration` as stalled
    pub fn with_job_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.manual = Arc::new(JobQueue::new("manual-sync", self.manual.concurrency()).with_lock_duration(lock_duration));
        self.recurring =
            Arc::new(JobQueue::new("recurring-sync", self.recurring.concurrency()).with_lock_duration(lock_duration));
        self
    }

    fn queue_for(&self, sync_type: SyncType) -> &Arc<JobQueue> {
        match sync_type {
            SyncType::Manual => &self.manual,
            SyncType::Recurring => &self.recurring,
        }
    }

    /// Enqueue a sync unless an identical one is already waiting, in which
    /// case the waiting job's handle is returned.
    pub fn enqueue_sync(&self, request: SyncRequest) -> Result<SyncJobHandle> {
        if request.sync_type == SyncType::Manual && self.manual_syncs_disabled {
            return Err(Error::ManualSyncsDisabled);
        }

        let key = DedupKey::new(request.sync_type, &request.wallet, &request.secondary);
        let (handle, inserted) = self.dedup.record_or_existing(key.clone());
        if !inserted {
            tracing::debug!(
                "Sync ({}) for {} to {} already queued as {}",
                request.sync_type,
                request.wallet,
                request.secondary,
                handle.id
            );
            return Ok(handle);
        }

        let job = SyncJob {
            id: handle.id,
            request,
            enqueued_at: handle.enqueued_at,
        };
        if let Err(e) = self.queue_for(job.request.sync_type).push(job) {
            self.dedup.remove(&key);
            return Err(e);
        }
        Ok(handle)
    }

    /// Spawn dispatchers for both queues
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        [Arc::clone(&self.manual), Arc::clone(&self.recurring)]
            .into_iter()
            .map(|queue| {
                let scheduler = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let name = queue.name().to_string();
                    let handler = move |job: SyncJob| {
                        let scheduler = Arc::clone(&scheduler);
                        async move { scheduler.handle_job(job).await }
                    };
                    if let Err(e) = queue.run(handler, shutdown).await {
                        tracing::error!("Queue {} exited: {}", name, e);
                    }
                })
            })
            .collect()
    }

    async fn handle_job(&self, job: SyncJob) {
        let request = job.request.clone();
        // Active jobs release their key so an identical job may wait behind them
        self.dedup
            .remove(&DedupKey::new(request.sync_type, &request.wallet, &request.secondary));

        match self.monitor.process(&job).await {
            Ok(outcome) if outcome.requires_resync() => {
                let follow_up = SyncRequest {
                    immediate: false,
                    ..request
                };
                if let Err(e) = self.enqueue_sync(follow_up) {
                    tracing::error!("Failed to re-enqueue sync for job {}: {}", job.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Sync job {} failed: {}", job.id, e),
        }
    }

    pub fn queue_depths(&self) -> Vec<QueueDepth> {
        vec![self.manual.depth(), self.recurring.depth()]
    }

    pub fn queue_jobs(&self) -> SyncQueueJobs {
        SyncQueueJobs {
            manual_waiting: self.manual.jobs(JobStatus::Waiting),
            manual_active: self.manual.jobs(JobStatus::Active),
            recurring_waiting: self.recurring.jobs(JobStatus::Waiting),
            recurring_active: self.recurring.jobs(JobStatus::Active),
        }
    }

    pub fn pending_keys(&self) -> usize {
        self.dedup.len()
    }

    /// Issue immediate manual syncs to `secondary` until its clock for
    /// `wallet` reaches `primary_clock`. A new request goes out whenever
    /// the secondary reports it is not syncing and is still behind.
    pub async fn sync_until_caught_up(
        &self,
        secondary: &str,
        wallet: &str,
        primary_clock: i64,
        timeout: Duration,
    ) -> Result<()> {
        if self.manual_syncs_disabled {
            return Err(Error::ManualSyncsDisabled);
        }

        let payload = SyncPayload {
            wallet: vec![wallet.to_string()],
            creator_node_endpoint: self.self_endpoint.clone(),
            sync_type: SyncType::Manual,
            immediate: true,
        };
        let deadline = Instant::now() + timeout;

        self.client.request_sync(secondary, &payload).await?;
        loop {
            tokio::time::sleep(MANUAL_SYNC_POLL_INTERVAL).await;

            match self.client.clock_status(secondary, wallet).await {
                Ok(status) if status.clock_value >= primary_clock => return Ok(()),
                Ok(status) if !status.sync_in_progress => {
                    if let Err(e) = self.client.request_sync(secondary, &payload).await {
                        tracing::warn!("Manual sync to {} for {} failed: {}", secondary, wallet, e);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Clock poll of {} for {} failed: {}", secondary, wallet, e),
            }

            if Instant::now() >= deadline {
                return Err(Error::SyncTimeout {
                    secondary: secondary.to_string(),
                    wallet: wallet.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SyncHistory;
    use crate::store::PeerClockStore;
    use crate::testing::FakePeers;

    const PRIMARY: &str = "http://cn1";

    fn scheduler(peers: &Arc<FakePeers>, manual_disabled: bool) -> Arc<SyncScheduler> {
        let client: Arc<dyn PeerClient> = Arc::clone(peers) as Arc<dyn PeerClient>;
        let monitor = Arc::new(SyncMonitor::new(
            Arc::clone(&client),
            Arc::new(PeerClockStore::new(Arc::clone(&client), PRIMARY)),
            Arc::new(SyncHistory::in_memory().unwrap()),
            PRIMARY,
            MonitorSettings {
                poll_interval: Duration::from_secs(1),
                max_duration: Duration::from_secs(5),
                daily_failure_threshold: 20,
            },
        ));
        Arc::new(SyncScheduler::new(monitor, client, PRIMARY, 2, 2, manual_disabled))
    }

    #[tokio::test]
    async fn test_enqueue_is_deduplicated() {
        let peers = Arc::new(FakePeers::new());
        let scheduler = scheduler(&peers, false);

        let first = scheduler
            .enqueue_sync(SyncRequest::recurring("0xabc", PRIMARY, "http://cn2"))
            .unwrap();
        let second = scheduler
            .enqueue_sync(SyncRequest::recurring("0xabc", PRIMARY, "http://cn2"))
            .unwrap();
        assert_eq!(first, second);

        scheduler
            .enqueue_sync(SyncRequest::recurring("0xabc", PRIMARY, "http://cn3"))
            .unwrap();

        let depths = scheduler.queue_depths();
        assert_eq!(depths[0].waiting, 0);
        assert_eq!(depths[1].waiting, 2);
        assert_eq!(scheduler.pending_keys(), 2);
        assert_eq!(scheduler.queue_jobs().recurring_waiting.len(), 2);
    }

    #[tokio::test]
    async fn test_manual_syncs_can_be_disabled() {
        let peers = Arc::new(FakePeers::new());
        let scheduler = scheduler(&peers, true);
        let request = SyncRequest {
            sync_type: SyncType::Manual,
            immediate: true,
            ..SyncRequest::recurring("0xabc", PRIMARY, "http://cn2")
        };
        assert!(matches!(scheduler.enqueue_sync(request), Err(Error::ManualSyncsDisabled)));
        assert!(matches!(
            scheduler
                .sync_until_caught_up("http://cn2", "0xabc", 5, Duration::from_secs(1))
                .await,
            Err(Error::ManualSyncsDisabled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_job_releases_key_and_completes() {
        let peers = Arc::new(FakePeers::new());
        peers.set_clock(PRIMARY, "0xabc", 4);
        peers.set_sync_target("http://cn2", "0xabc", 4);
        let scheduler = scheduler(&peers, false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = scheduler.start(shutdown_rx);

        scheduler
            .enqueue_sync(SyncRequest::recurring("0xabc", PRIMARY, "http://cn2"))
            .unwrap();

        for _ in 0..100 {
            if !peers.sync_requests().is_empty() && scheduler.queue_depths()[1].active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(peers.sync_requests().len(), 1);
        assert_eq!(scheduler.pending_keys(), 0);
        assert_eq!(scheduler.queue_depths()[1].waiting, 0);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_until_caught_up() {
        let peers = Arc::new(FakePeers::new());
        peers.set_clock("http://cn2", "0xabc", 1);
        peers.set_sync_target("http://cn2", "0xabc", 9);
        let scheduler = scheduler(&peers, false);

        scheduler
            .sync_until_caught_up("http://cn2", "0xabc", 9, Duration::from_secs(5))
            .await
            .unwrap();
        let syncs = peers.sync_requests();
        assert_eq!(syncs.len(), 1);
        assert!(syncs[0].1.immediate);
        assert_eq!(syncs[0].1.sync_type, SyncType::Manual);

        let result = scheduler
            .sync_until_caught_up("http://cn2", "0xabc", 20, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(Error::SyncTimeout { .. })));
        assert!(peers.sync_requests().len() > 2);
    }
}
