//! Reconciliation Orchestrator
//!
//! Runs one reconciliation pass over a modulo slice of this node's users:
//! health-check peers, fetch clocks, decide syncs and replacements, then
//! enqueue the syncs and issue the replacements one user at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::clock::{build_replica_to_wallets, ClockStatusOracle};
use super::health::{HealthThresholds, PeerHealthEvaluator};
use super::necessity::{
    aggregate, compute_secondary_metrics, issue_sync_requests, NecessityContext, ReconfigThresholds, SecondaryMetrics,
};
use super::reconfig::{ReconfigExecutor, ReconfigOutcome};
use super::selector::ReplicaSetSelector;
use super::trail::DecisionTrail;
use crate::authority::AssignmentAuthority;
use crate::config::SnapbackConfig;
use crate::error::{Error, Result};
use crate::model::{NodeUser, ReconfigMode};
use crate::peer::{fetch_all_node_users, PeerClient, UserDirectory};
use crate::retry::RetryPolicy;
use crate::state::{NodeHealthStore, ReplicaDirectory, SyncHistory};
use crate::sync::SyncScheduler;

const CLOCK_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Pass tunables
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub self_endpoint: String,
    pub modulo_base: u64,
    pub page_size: usize,
    pub allow_legacy_provider_ids: bool,
    pub aggregate_batch_size: usize,
    pub aggregate_concurrency: usize,
    pub highest_mode: ReconfigMode,
    pub node_whitelist: Vec<String>,
    pub reconfig_thresholds: ReconfigThresholds,
}

impl From<&SnapbackConfig> for OrchestratorSettings {
    fn from(config: &SnapbackConfig) -> Self {
        Self {
            self_endpoint: config.node.endpoint.clone(),
            modulo_base: config.state_machine.modulo_base.max(1),
            page_size: config.discovery.page_size,
            allow_legacy_provider_ids: config.discovery.allow_legacy_unreported_provider_ids,
            aggregate_batch_size: config.state_machine.aggregate_batch_size,
            aggregate_concurrency: config.state_machine.aggregate_concurrency,
            highest_mode: config.highest_reconfig_mode(),
            node_whitelist: config.reconfig.node_whitelist.clone(),
            reconfig_thresholds: ReconfigThresholds::new(
                config.reconfig.min_failed_sync_requests_before_reconfig,
                config.reconfig.min_secondary_user_sync_success_percent,
            ),
        }
    }
}

/// External collaborators and shared stores
pub struct Collaborators {
    pub users: Arc<dyn UserDirectory>,
    pub authority: Arc<dyn AssignmentAuthority>,
    pub client: Arc<dyn PeerClient>,
    pub directory: Arc<ReplicaDirectory>,
    pub node_health: Arc<NodeHealthStore>,
    pub history: Arc<SyncHistory>,
    pub scheduler: Arc<SyncScheduler>,
}

/// Summary of one pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub modulo_slice: u64,
    pub users: usize,
    pub unhealthy_peers: usize,
    pub syncs_required: usize,
    pub syncs_enqueued: usize,
    pub reconfig_ops: usize,
    pub reconfigs_issued: usize,
    pub reconfig_outcomes: Vec<ReconfigOutcome>,
    /// Phase failures that did not abort the pass
    pub errors: Vec<String>,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    users: Arc<dyn UserDirectory>,
    authority: Arc<dyn AssignmentAuthority>,
    directory: Arc<ReplicaDirectory>,
    history: Arc<SyncHistory>,
    scheduler: Arc<SyncScheduler>,
    health: PeerHealthEvaluator,
    oracle: ClockStatusOracle,
    executor: ReconfigExecutor,
    current_slice: AtomicU64,
    last_trail: RwLock<Option<DecisionTrail>>,
}

impl Orchestrator {
    pub fn new(config: &SnapbackConfig, deps: Collaborators) -> Self {
        let settings = OrchestratorSettings::from(config);
        let health = PeerHealthEvaluator::new(
            Arc::clone(&deps.client),
            deps.node_health,
            HealthThresholds::from(&config.health),
            &settings.self_endpoint,
            config.health.concurrency,
        );
        let oracle = ClockStatusOracle::new(
            Arc::clone(&deps.client),
            config.sync.batch_clock_status_batch_size,
            RetryPolicy::new(config.sync.max_batch_clock_fetch_retries, CLOCK_RETRY_BASE_DELAY),
            config.sync.clock_fetch_concurrency,
        );
        let executor = ReconfigExecutor::new(
            ReplicaSetSelector::new(deps.client, config.reconfig.max_select_attempts),
            Arc::clone(&deps.authority),
            Arc::clone(&deps.scheduler),
        );
        let start_slice = rand::thread_rng().gen_range(0..settings.modulo_base);

        Self {
            settings,
            users: deps.users,
            authority: deps.authority,
            directory: deps.directory,
            history: deps.history,
            scheduler: deps.scheduler,
            health,
            oracle,
            executor,
            current_slice: AtomicU64::new(start_slice),
            last_trail: RwLock::new(None),
        }
    }

    pub fn current_slice(&self) -> u64 {
        self.current_slice.load(Ordering::SeqCst)
    }

    pub fn modulo_base(&self) -> u64 {
        self.settings.modulo_base
    }

    /// Trail of the most recent pass
    pub async fn last_trail(&self) -> Option<DecisionTrail> {
        self.last_trail.read().await.clone()
    }

    /// Run one pass. The slice advances whether or not the pass succeeds.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let slice = self.current_slice();
        let base = self.settings.modulo_base;
        // Advanced up front so a pass cancelled as stalled still moves on
        self.current_slice.store((slice + 1) % base, Ordering::SeqCst);
        let mut trail = DecisionTrail::new();
        trail.record(
            "BEGIN reconciliation pass",
            json!({ "currentModuloSlice": slice, "moduloBase": base }),
        );

        let result = self.reconcile(slice, &mut trail).await;
        if let Err(e) = &result {
            trail.record("reconciliation pass Error", json!({ "error": e.to_string() }));
        }
        trail.finish(
            "END reconciliation pass",
            json!({ "currentModuloSlice": slice, "moduloBase": base }),
        );

        tracing::info!("Reconciliation decision trail: {}", trail.to_json());
        *self.last_trail.write().await = Some(trail);

        result
    }

    async fn reconcile(&self, slice: u64, trail: &mut DecisionTrail) -> Result<PassReport> {
        let self_endpoint = self.settings.self_endpoint.as_str();
        let mut report = PassReport {
            modulo_slice: slice,
            ..Default::default()
        };

        let users = match fetch_all_node_users(
            &*self.users,
            self.settings.page_size,
            self.settings.allow_legacy_provider_ids,
        )
        .await
        {
            Ok(all) => {
                let total = all.len();
                let sliced = slice_users(all, self.settings.modulo_base, slice);
                trail.record(
                    "fetch and slice users Success",
                    json!({ "nodeUsersLength": total, "sliceLength": sliced.len() }),
                );
                sliced
            }
            Err(e) => {
                trail.record("fetch and slice users Error", json!({ "error": e.to_string() }));
                return Err(e);
            }
        };
        report.users = users.len();

        let mut unhealthy_peers = self.health.unhealthy_peers(&users, false).await;
        trail.record(
            "unhealthy peers Success",
            json!({ "unhealthyPeerSetLength": unhealthy_peers.len(), "unhealthyPeers": &unhealthy_peers }),
        );

        let replica_to_wallets = build_replica_to_wallets(&users);
        trail.record(
            "build replica to wallets Success",
            json!({ "numReplicaSetNodes": replica_to_wallets.len() }),
        );

        let mut highest_mode = self.settings.highest_mode;
        match self.directory.refresh(&*self.authority).await {
            Ok(count) => trail.record("refresh replica directory Success", json!({ "directorySize": count })),
            Err(e) => {
                highest_mode = ReconfigMode::Disabled;
                trail.record("refresh replica directory Error", json!({ "error": e.to_string() }));
            }
        }

        let fetch = self.oracle.fetch_clocks(&replica_to_wallets).await;
        trail.record(
            "fetch clock statuses Success",
            json!({ "unresponsiveReplicas": &fetch.unhealthy }),
        );
        unhealthy_peers.extend(fetch.unhealthy.into_iter().filter(|r| r != self_endpoint));
        let clocks = fetch.clocks;
        report.unhealthy_peers = unhealthy_peers.len();

        let metrics = match compute_secondary_metrics(&users, self_endpoint, &self.history).await {
            Ok(metrics) => {
                trail.record("compute sync metrics Success", json!({ "numMetrics": metrics.len() }));
                metrics
            }
            Err(e) => {
                tracing::error!("Failed to compute secondary sync metrics: {}", e);
                trail.record("compute sync metrics Error", json!({ "error": e.to_string() }));
                report.errors.push(e.to_string());
                SecondaryMetrics::default()
            }
        };
        let directory = self.directory.snapshot().await;
        let ctx = NecessityContext {
            self_endpoint,
            unhealthy_peers: &unhealthy_peers,
            directory: &directory,
            metrics: &metrics,
            thresholds: self.settings.reconfig_thresholds,
        };
        let decisions = aggregate(
            &users,
            &ctx,
            &self.health,
            self.settings.aggregate_batch_size,
            self.settings.aggregate_concurrency,
        )
        .await;
        report.reconfig_ops = decisions.reconfig_ops.len();
        trail.record(
            "aggregate reconfig and sync ops Success",
            json!({
                "requiredUpdateReplicaSetOpsLength": decisions.reconfig_ops.len(),
                "potentialSyncRequestsLength": decisions.potential_syncs.len(),
                "failedUsers": decisions.failed_users,
            }),
        );

        let issued = issue_sync_requests(&decisions.potential_syncs, &clocks, self_endpoint, &self.scheduler);
        report.syncs_required = issued.required;
        report.syncs_enqueued = issued.enqueued;
        if issued.errors > issued.enqueued {
            let e = Error::BatchPartialFailure {
                failed: issued.errors,
                total: issued.required,
            };
            trail.record("issue sync requests Error", json!({ "error": e.to_string(), "report": issued }));
            report.errors.push(e.to_string());
        } else {
            trail.record("issue sync requests Success", &issued);
        }

        if decisions.reconfig_ops.is_empty() {
            return Ok(report);
        }

        let pool = self.healthy_node_pool().await;
        if pool.is_empty() {
            let msg = "no healthy nodes available for new replica sets".to_string();
            trail.record("issue update replica set ops Error", json!({ "error": &msg }));
            report.errors.push(msg);
            return Ok(report);
        }

        let mut failures = 0;
        for op in &decisions.reconfig_ops {
            let outcome = self
                .executor
                .issue_update_replica_set_op(op, &pool, &clocks, &directory, highest_mode)
                .await;
            if outcome.error_msg.is_some() {
                failures += 1;
            }
            if outcome.issued_reconfig {
                report.reconfigs_issued += 1;
            }
            report.reconfig_outcomes.push(outcome);
        }

        if failures > 0 {
            let msg = format!("update replica set failed for {} users", failures);
            trail.record("issue update replica set ops Error", json!({ "error": &msg }));
            report.errors.push(msg);
        } else {
            trail.record(
                "issue update replica set ops Success",
                json!({ "numUpdateReplicaOpsIssued": report.reconfigs_issued }),
            );
        }

        Ok(report)
    }

    /// Registered nodes, optionally whitelisted, excluding self, that pass
    /// a full health check
    async fn healthy_node_pool(&self) -> Vec<String> {
        let whitelist = &self.settings.node_whitelist;
        let candidates: Vec<String> = self
            .directory
            .endpoints()
            .await
            .into_iter()
            .filter(|e| e != &self.settings.self_endpoint)
            .filter(|e| whitelist.is_empty() || whitelist.contains(e))
            .collect();
        self.health.healthy_subset(candidates).await
    }
}

/// Users whose ID falls in `slice` modulo `base`
pub fn slice_users(users: Vec<NodeUser>, base: u64, slice: u64) -> Vec<NodeUser> {
    users
        .into_iter()
        .filter(|user| user.user_id % base.max(1) == slice)
        .collect()
}
