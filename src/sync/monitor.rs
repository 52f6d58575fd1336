//! Sync Monitor
//!
//! Issues a queued sync to its secondary, then polls the secondary's clock
//! until it catches up to the primary or the monitoring window closes.
//! Outcomes feed the sync history used by later passes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::queue::SyncJob;
use crate::error::Result;
use crate::peer::{PeerClient, SyncPayload};
use crate::state::SyncHistory;
use crate::store::ClockStore;

/// Result of processing one sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
    /// Daily failure threshold already exceeded, nothing issued
    Skipped,
    /// Secondary reached the primary's clock
    CaughtUp,
    /// Secondary advanced but is still behind
    Progressed { from: i64, to: i64 },
    /// Secondary did not advance
    NoProgress,
}

impl SyncOutcome {
    /// Whether another sync should be enqueued for the same key
    pub fn requires_resync(&self) -> bool {
        matches!(self, SyncOutcome::Progressed { .. } | SyncOutcome::NoProgress)
    }
}

/// Monitoring tunables
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub max_duration: Duration,
    pub daily_failure_threshold: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(15_000),
            max_duration: Duration::from_millis(300_000),
            daily_failure_threshold: 20,
        }
    }
}

/// Processes sync jobs on behalf of the primary
pub struct SyncMonitor {
    client: Arc<dyn PeerClient>,
    clock_store: Arc<dyn ClockStore>,
    history: Arc<SyncHistory>,
    self_endpoint: String,
    settings: MonitorSettings,
}

impl SyncMonitor {
    pub fn new(
        client: Arc<dyn PeerClient>,
        clock_store: Arc<dyn ClockStore>,
        history: Arc<SyncHistory>,
        self_endpoint: impl Into<String>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            client,
            clock_store,
            history,
            self_endpoint: self_endpoint.into(),
            settings,
        }
    }

    pub async fn process(&self, job: &SyncJob) -> Result<SyncOutcome> {
        let request = &job.request;
        let label = format!(
            "({}) wallet {} secondary {}",
            request.sync_type, request.wallet, request.secondary
        );

        let failures = self
            .history
            .failure_count_today(&request.secondary, &request.wallet, request.sync_type)
            .await?;
        if failures > self.settings.daily_failure_threshold {
            tracing::error!(
                "{} || {} failures today exceeds threshold {}, not issuing further syncs today",
                label,
                failures,
                self.settings.daily_failure_threshold
            );
            return Ok(SyncOutcome::Skipped);
        }

        // Reconfig may schedule syncs on behalf of a new primary elsewhere
        let primary_clock = if request.primary == self.self_endpoint {
            self.clock_store.clock_value(&request.wallet).await?
        } else {
            self.client.clock_status(&request.primary, &request.wallet).await?.clock_value
        };
        tracing::info!("Processing sync {} | primary clock {} | job {}", label, primary_clock, job.id);

        let payload = SyncPayload {
            wallet: vec![request.wallet.clone()],
            creator_node_endpoint: request.primary.clone(),
            sync_type: request.sync_type,
            immediate: request.immediate,
        };
        if let Err(e) = self.client.request_sync(&request.secondary, &payload).await {
            // Monitoring still runs; the secondary may have accepted the request
            tracing::error!("{} || Error issuing sync request: {}", label, e);
        }

        let outcome = self.monitor(&request.secondary, &request.wallet, primary_clock, &label).await;

        match outcome {
            SyncOutcome::CaughtUp | SyncOutcome::Progressed { .. } => {
                self.history
                    .record_success(&request.secondary, &request.wallet, request.sync_type)
                    .await?;
            }
            SyncOutcome::NoProgress => {
                self.history
                    .record_failure(&request.secondary, &request.wallet, request.sync_type)
                    .await?;
            }
            SyncOutcome::Skipped => {}
        }

        match outcome {
            SyncOutcome::Progressed { from, to } => tracing::info!(
                "{} || Secondary synced from clock {} to {} but is behind primary clock {}",
                label,
                from,
                to,
                primary_clock
            ),
            SyncOutcome::NoProgress => tracing::error!("{} || Secondary failed to progress", label),
            _ => tracing::debug!("{} || Sync complete", label),
        }

        Ok(outcome)
    }

    async fn monitor(&self, secondary: &str, wallet: &str, primary_clock: i64, label: &str) -> SyncOutcome {
        let started = Instant::now();
        let deadline = started + self.settings.max_duration;
        let mut initial: Option<i64> = None;
        let mut last: Option<i64> = None;

        while Instant::now() < deadline {
            match self.client.clock_status(secondary, wallet).await {
                Ok(status) => {
                    initial.get_or_insert(status.clock_value);
                    last = Some(status.clock_value);
                    // Can exceed primary_clock if writes landed after it was read
                    if status.clock_value >= primary_clock {
                        tracing::debug!("{} || Caught up in {:?}", label, started.elapsed());
                        return SyncOutcome::CaughtUp;
                    }
                }
                Err(e) => tracing::warn!("{} || Clock poll failed: {}", label, e),
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        match (initial, last) {
            (Some(from), Some(to)) if to > from => SyncOutcome::Progressed { from, to },
            _ => SyncOutcome::NoProgress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SyncRequest, SyncType};
    use crate::store::PeerClockStore;
    use crate::testing::FakePeers;
    use chrono::Utc;
    use uuid::Uuid;

    const PRIMARY: &str = "http://cn1";
    const SECONDARY: &str = "http://cn2";

    fn setup(peers: &Arc<FakePeers>) -> (SyncMonitor, Arc<SyncHistory>) {
        let history = Arc::new(SyncHistory::in_memory().unwrap());
        let monitor = SyncMonitor::new(
            Arc::clone(peers) as Arc<dyn PeerClient>,
            Arc::new(PeerClockStore::new(Arc::clone(peers) as Arc<dyn PeerClient>, PRIMARY)),
            Arc::clone(&history),
            PRIMARY,
            MonitorSettings {
                poll_interval: Duration::from_secs(15),
                max_duration: Duration::from_secs(60),
                daily_failure_threshold: 2,
            },
        );
        (monitor, history)
    }

    fn job() -> SyncJob {
        SyncJob {
            id: Uuid::new_v4(),
            request: SyncRequest::recurring("0xabc", PRIMARY, SECONDARY),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_caught_up_records_success() {
        let peers = Arc::new(FakePeers::new());
        peers.set_clock(PRIMARY, "0xabc", 10);
        peers.set_clock(SECONDARY, "0xabc", 3);
        peers.set_sync_target(SECONDARY, "0xabc", 10);
        let (monitor, history) = setup(&peers);

        let outcome = monitor.process(&job()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::CaughtUp);
        assert!(!outcome.requires_resync());

        let metrics = history.user_metrics_today(SECONDARY, "0xabc").await.unwrap();
        assert_eq!(metrics.success_count, 1);

        let syncs = peers.sync_requests();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].1.creator_node_endpoint, PRIMARY);
        assert_eq!(syncs[0].1.sync_type, SyncType::Recurring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_progress_records_failure_and_requires_resync() {
        let peers = Arc::new(FakePeers::new());
        peers.set_clock(PRIMARY, "0xabc", 10);
        peers.set_clock(SECONDARY, "0xabc", 3);
        let (monitor, history) = setup(&peers);

        let outcome = monitor.process(&job()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::NoProgress);
        assert!(outcome.requires_resync());
        assert_eq!(
            history.failure_count_today(SECONDARY, "0xabc", SyncType::Recurring).await.unwrap(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_progress_counts_as_success() {
        let peers = Arc::new(FakePeers::new());
        peers.set_clock(PRIMARY, "0xabc", 10);
        peers.set_clock(SECONDARY, "0xabc", 3);
        let (monitor, history) = setup(&peers);

        // Secondary advances to 7 after the first poll
        let advancing = Arc::clone(&peers);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            advancing.set_clock(SECONDARY, "0xabc", 7);
        });

        let outcome = monitor.process(&job()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Progressed { from: 3, to: 7 });
        assert!(outcome.requires_resync());
        assert_eq!(history.user_metrics_today(SECONDARY, "0xabc").await.unwrap().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_primary_clock_and_endpoint() {
        let peers = Arc::new(FakePeers::new());
        peers.set_clock("http://cn3", "0xabc", 6);
        peers.set_sync_target(SECONDARY, "0xabc", 6);
        let (monitor, _history) = setup(&peers);

        let mut job = job();
        job.request.primary = "http://cn3".to_string();
        assert_eq!(monitor.process(&job).await.unwrap(), SyncOutcome::CaughtUp);
        assert_eq!(peers.sync_requests()[0].1.creator_node_endpoint, "http://cn3");
        assert_eq!(peers.batch_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_after_daily_failure_threshold() {
        let peers = Arc::new(FakePeers::new());
        let (monitor, history) = setup(&peers);
        for _ in 0..3 {
            history.record_failure(SECONDARY, "0xabc", SyncType::Recurring).await.unwrap();
        }

        assert_eq!(monitor.process(&job()).await.unwrap(), SyncOutcome::Skipped);
        assert!(peers.sync_requests().is_empty());
    }
}
