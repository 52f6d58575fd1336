//! Snapback Node
//!
//! Wires the reconciliation engine together and owns its background tasks:
//! the two sync queues and the periodic state-machine loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::authority::{AssignmentAuthority, HttpAuthority};
use crate::config::SnapbackConfig;
use crate::error::{Error, Result};
use crate::peer::{HttpPeerClient, HttpUserDirectory, PeerClient, PeerTimeouts, RequestSigner, UserDirectory};
use crate::reconcile::{Collaborators, DecisionTrail, Orchestrator, PassReport};
use crate::state::{NodeHealthStore, ReplicaDirectory, SyncHistory};
use crate::store::PeerClockStore;
use crate::sync::{MonitorSettings, QueueDepth, SyncMonitor, SyncQueueJobs, SyncScheduler};

/// Outcome of the most recent pass
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stalled: bool,
    pub report: Option<PassReport>,
    pub error: Option<String>,
}

/// State shared with the state-machine loop
struct PassState {
    completed: AtomicU64,
    last: RwLock<Option<PassSummary>>,
}

#[derive(Debug, Clone, Copy)]
struct LoopTiming {
    initial_delay: Duration,
    interval: Duration,
    lock_duration: Duration,
}

/// A running reconciliation engine
pub struct Snapback {
    config: SnapbackConfig,
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<SyncScheduler>,
    history: Arc<SyncHistory>,
    directory: Arc<ReplicaDirectory>,
    node_health: Arc<NodeHealthStore>,
    passes: Arc<PassState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl Snapback {
    /// Build a node talking to real peers, discovery and the authority
    pub fn from_config(config: SnapbackConfig) -> Result<Self> {
        config.validate()?;

        let signer = RequestSigner::new(config.node.sp_id, config.node.delegate_private_key.clone());
        let client: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(signer, PeerTimeouts::from_config(&config))?);
        let users: Arc<dyn UserDirectory> = Arc::new(HttpUserDirectory::new(
            config.discovery.endpoint.clone(),
            config.node.endpoint.clone(),
            Duration::from_millis(config.discovery.request_timeout_ms),
        )?);
        let authority: Arc<dyn AssignmentAuthority> = Arc::new(HttpAuthority::new(
            config.authority.endpoint.clone(),
            Duration::from_millis(config.authority.request_timeout_ms),
        )?);
        let history = Arc::new(SyncHistory::open(&config.state_dir())?);

        Ok(Self::with_collaborators(config, client, users, authority, history))
    }

    /// Build a node around supplied collaborators
    pub fn with_collaborators(
        config: SnapbackConfig,
        client: Arc<dyn PeerClient>,
        users: Arc<dyn UserDirectory>,
        authority: Arc<dyn AssignmentAuthority>,
        history: Arc<SyncHistory>,
    ) -> Self {
        let self_endpoint = config.node.endpoint.clone();
        let directory = Arc::new(ReplicaDirectory::new());
        let node_health = Arc::new(NodeHealthStore::new(config.max_primary_unhealthy()));

        let monitor = Arc::new(SyncMonitor::new(
            Arc::clone(&client),
            Arc::new(PeerClockStore::new(Arc::clone(&client), &self_endpoint)),
            Arc::clone(&history),
            &self_endpoint,
            MonitorSettings {
                poll_interval: config.monitoring_retry_delay(),
                max_duration: config.max_monitoring_duration(),
                daily_failure_threshold: config.sync.daily_failure_count_threshold,
            },
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            monitor,
            Arc::clone(&client),
            &self_endpoint,
            config.sync.max_manual_concurrency,
            config.sync.max_recurring_concurrency,
            config.sync.manual_syncs_disabled,
        )
        .with_job_lock_duration(config.job_lock_duration()));

        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            Collaborators {
                users,
                authority,
                client,
                directory: Arc::clone(&directory),
                node_health: Arc::clone(&node_health),
                history: Arc::clone(&history),
                scheduler: Arc::clone(&scheduler),
            },
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            orchestrator,
            scheduler,
            history,
            directory,
            node_health,
            passes: Arc::new(PassState {
                completed: AtomicU64::new(0),
                last: RwLock::new(None),
            }),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started_at: Utc::now(),
        }
    }

    /// Start the sync queues and the state-machine loop
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(Error::Internal("snapback already started".into()));
        }
        if *self.shutdown_tx.borrow() {
            return Err(Error::ShuttingDown);
        }

        tracing::info!(
            "Starting snapback for {} (highest reconfig mode {}, modulo base {})",
            self.config.node.endpoint,
            self.config.highest_reconfig_mode(),
            self.orchestrator.modulo_base()
        );

        tasks.extend(self.scheduler.start(self.shutdown_tx.subscribe()));

        let timing = LoopTiming {
            initial_delay: self.config.initial_delay(),
            interval: self.config.job_interval(),
            lock_duration: self.config.lock_duration(),
        };
        tasks.push(tokio::spawn(state_machine_loop(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.history),
            Arc::clone(&self.passes),
            timing,
            self.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// Signal shutdown and wait for background tasks. Passes and sync jobs
    /// already in flight are abandoned.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Snapback stopped");
    }

    pub fn config(&self) -> &SnapbackConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn history(&self) -> &Arc<SyncHistory> {
        &self.history
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn node_health(&self) -> &Arc<NodeHealthStore> {
        &self.node_health
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn queue_depths(&self) -> Vec<QueueDepth> {
        self.scheduler.queue_depths()
    }

    pub fn queue_jobs(&self) -> SyncQueueJobs {
        self.scheduler.queue_jobs()
    }

    pub async fn last_trail(&self) -> Option<DecisionTrail> {
        self.orchestrator.last_trail().await
    }

    pub async fn last_pass(&self) -> Option<PassSummary> {
        self.passes.last.read().await.clone()
    }

    pub fn passes_completed(&self) -> u64 {
        self.passes.completed.load(Ordering::SeqCst)
    }

    pub async fn directory_size(&self) -> usize {
        self.directory.len().await
    }
}

async fn state_machine_loop(
    orchestrator: Arc<Orchestrator>,
    history: Arc<SyncHistory>,
    passes: Arc<PassState>,
    timing: LoopTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(timing.initial_delay) => {}
        _ = shutdown.changed() => return,
    }

    let mut ticker = tokio::time::interval(timing.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!("State machine loop started, interval {:?}", timing.interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let started = Instant::now();
        let result = tokio::select! {
            result = tokio::time::timeout(timing.lock_duration, orchestrator.run_pass()) => result,
            _ = shutdown.changed() => break,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let summary = match result {
            Ok(Ok(report)) => {
                tracing::info!(
                    "Reconciliation pass over slice {} done in {}ms: {} users, {} syncs enqueued, {} reconfigs issued",
                    report.modulo_slice,
                    duration_ms,
                    report.users,
                    report.syncs_enqueued,
                    report.reconfigs_issued
                );
                PassSummary {
                    finished_at: Utc::now(),
                    duration_ms,
                    stalled: false,
                    report: Some(report),
                    error: None,
                }
            }
            Ok(Err(e)) => {
                tracing::error!("Reconciliation pass failed: {}", e);
                PassSummary {
                    finished_at: Utc::now(),
                    duration_ms,
                    stalled: false,
                    report: None,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                tracing::warn!(
                    "Reconciliation pass stalled past lock duration {:?}, not retrying",
                    timing.lock_duration
                );
                PassSummary {
                    finished_at: Utc::now(),
                    duration_ms,
                    stalled: true,
                    report: None,
                    error: Some("stalled".into()),
                }
            }
        };

        passes.completed.fetch_add(1, Ordering::SeqCst);
        *passes.last.write().await = Some(summary);

        match history.prune(Utc::now().date_naive()).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!("Pruned {} expired sync history rows", pruned),
            Err(e) => tracing::warn!("Failed to prune sync history: {}", e),
        }
    }

    tracing::info!("State machine loop stopped");
}
