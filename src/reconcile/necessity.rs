//! Sync Necessity
//!
//! Decides, per user, which secondaries should be sent a sync request and
//! which replicas should be replaced.

use std::collections::{BTreeSet, HashMap};

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;

use super::clock::{clock_for, ReplicaClocks};
use super::health::PrimaryHealthCheck;
use crate::error::{Error, Result};
use crate::model::{NodeUser, ReconfigOp, ReplicaInfo, ReplicaRole, SyncRequest};
use crate::state::{SyncHistory, SyncMetrics};
use crate::sync::SyncScheduler;

/// (secondary, wallet) -> today's sync metrics
pub type SecondaryMetrics = HashMap<(String, String), SyncMetrics>;

/// When a secondary's own sync record makes it a replacement candidate
#[derive(Debug, Clone, Copy)]
pub struct ReconfigThresholds {
    pub min_failed_sync_requests: u64,
    pub min_success_rate: f64,
}

impl ReconfigThresholds {
    pub fn new(min_failed_sync_requests: u64, min_success_percent: u64) -> Self {
        Self {
            min_failed_sync_requests,
            min_success_rate: min_success_percent as f64 / 100.0,
        }
    }

    fn breached(&self, metrics: &SyncMetrics) -> bool {
        metrics.failure_count >= self.min_failed_sync_requests && metrics.success_rate() < self.min_success_rate
    }
}

impl Default for ReconfigThresholds {
    fn default() -> Self {
        Self::new(20, 50)
    }
}

/// Inputs shared by every user in a pass
pub struct NecessityContext<'a> {
    pub self_endpoint: &'a str,
    pub unhealthy_peers: &'a BTreeSet<String>,
    /// Endpoint -> provider ID. Provider checks are skipped when empty.
    pub directory: &'a HashMap<String, u64>,
    pub metrics: &'a SecondaryMetrics,
    pub thresholds: ReconfigThresholds,
}

impl NecessityContext<'_> {
    fn mismatched(&self, replica: &ReplicaInfo) -> bool {
        !self.directory.is_empty() && replica.provider_mismatch(self.directory.get(&replica.endpoint).copied())
    }
}

/// Decision for one user
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserDecision {
    pub potential_syncs: Vec<SyncRequest>,
    pub reconfig: Option<ReconfigOp>,
}

/// Decide syncs and replacements for one user
pub async fn evaluate_user(
    user: &NodeUser,
    ctx: &NecessityContext<'_>,
    primary_check: &dyn PrimaryHealthCheck,
) -> Result<UserDecision> {
    let role = user.role_of(ctx.self_endpoint).ok_or_else(|| {
        Error::DataInconsistency(format!(
            "user {} does not list {} as a replica",
            user.user_id, ctx.self_endpoint
        ))
    })?;

    let mut decision = UserDecision::default();
    let mut unhealthy = BTreeSet::new();

    if role == ReplicaRole::Primary {
        for secondary in [&user.secondary1, &user.secondary2].into_iter().flatten() {
            let endpoint = &secondary.endpoint;
            let metrics = ctx
                .metrics
                .get(&(endpoint.clone(), user.wallet.clone()))
                .copied()
                .unwrap_or_default();

            if ctx.mismatched(secondary) {
                tracing::warn!("User {} secondary {} provider ID mismatch", user.wallet, endpoint);
                unhealthy.insert(endpoint.clone());
            } else if ctx.unhealthy_peers.contains(endpoint) {
                unhealthy.insert(endpoint.clone());
            } else if ctx.thresholds.breached(&metrics) {
                tracing::warn!(
                    "User {} secondary {} sync success rate {:.2} with {} failures",
                    user.wallet,
                    endpoint,
                    metrics.success_rate(),
                    metrics.failure_count
                );
                unhealthy.insert(endpoint.clone());
            } else {
                decision
                    .potential_syncs
                    .push(SyncRequest::recurring(&user.wallet, ctx.self_endpoint, endpoint));
            }
        }
    } else {
        for (other_role, replica) in user.replicas() {
            if replica.endpoint == ctx.self_endpoint {
                continue;
            }

            if ctx.mismatched(replica) {
                tracing::warn!("User {} replica {} provider ID mismatch", user.wallet, replica.endpoint);
                unhealthy.insert(replica.endpoint.clone());
            } else if ctx.unhealthy_peers.contains(&replica.endpoint) {
                let confirmed = other_role != ReplicaRole::Primary
                    || !primary_check.is_primary_healthy(&replica.endpoint).await;
                if confirmed {
                    unhealthy.insert(replica.endpoint.clone());
                }
            }
        }
    }

    if !unhealthy.is_empty() {
        decision.reconfig = Some(ReconfigOp::for_user(user, unhealthy));
    }
    Ok(decision)
}

/// Decisions across all users in a pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct Aggregate {
    pub potential_syncs: Vec<SyncRequest>,
    pub reconfig_ops: Vec<ReconfigOp>,
    pub failed_users: usize,
}

/// Evaluate users in batches with bounded parallelism. A user that fails
/// is logged and skipped.
pub async fn aggregate(
    users: &[NodeUser],
    ctx: &NecessityContext<'_>,
    primary_check: &dyn PrimaryHealthCheck,
    batch_size: usize,
    concurrency: usize,
) -> Aggregate {
    let mut result = Aggregate::default();

    for batch in users.chunks(batch_size.max(1)) {
        let futures: Vec<_> = batch
            .iter()
            .map(|user| {
                async move { (user.user_id, evaluate_user(user, ctx, primary_check).await) }.boxed()
            })
            .collect();
        let decisions: Vec<(u64, Result<UserDecision>)> = stream::iter(futures)
            .buffered(concurrency.max(1))
            .collect()
            .await;

        for (user_id, decision) in decisions {
            match decision {
                Ok(decision) => {
                    result.potential_syncs.extend(decision.potential_syncs);
                    result.reconfig_ops.extend(decision.reconfig);
                }
                Err(e) => {
                    tracing::error!("Skipping user {}: {}", user_id, e);
                    result.failed_users += 1;
                }
            }
        }
    }

    result
}

/// Today's metrics for every (secondary, wallet) this node is primary for
pub async fn compute_secondary_metrics(
    users: &[NodeUser],
    self_endpoint: &str,
    history: &SyncHistory,
) -> Result<SecondaryMetrics> {
    let mut metrics = HashMap::new();
    for user in users.iter().filter(|u| u.primary_endpoint() == Some(self_endpoint)) {
        for secondary in [user.secondary1_endpoint(), user.secondary2_endpoint()].into_iter().flatten() {
            let m = history.user_metrics_today(secondary, &user.wallet).await?;
            metrics.insert((secondary.to_string(), user.wallet.clone()), m);
        }
    }
    Ok(metrics)
}

/// Counts from issuing sync requests
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncIssueReport {
    pub required: usize,
    pub enqueued: usize,
    pub errors: usize,
}

/// Enqueue a recurring sync for every potential request where this node
/// is primary and ahead of the secondary. Unknown clocks count as -1.
pub fn issue_sync_requests(
    potential: &[SyncRequest],
    clocks: &ReplicaClocks,
    self_endpoint: &str,
    scheduler: &SyncScheduler,
) -> SyncIssueReport {
    let mut report = SyncIssueReport::default();

    for request in potential {
        if request.primary != self_endpoint {
            continue;
        }
        let primary_clock = clock_for(clocks, &request.primary, &request.wallet);
        let secondary_clock = clock_for(clocks, &request.secondary, &request.wallet);
        if primary_clock <= secondary_clock {
            continue;
        }

        report.required += 1;
        match scheduler.enqueue_sync(request.clone()) {
            Ok(_) => report.enqueued += 1,
            Err(e) => {
                tracing::error!(
                    "Failed to enqueue sync for {} to {}: {}",
                    request.wallet,
                    request.secondary,
                    e
                );
                report.errors += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerClient;
    use crate::store::PeerClockStore;
    use crate::sync::{MonitorSettings, SyncMonitor};
    use crate::testing::{node_user, FakePeers};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedPrimary(bool);

    #[async_trait]
    impl PrimaryHealthCheck for FixedPrimary {
        async fn is_primary_healthy(&self, _endpoint: &str) -> bool {
            self.0
        }
    }

    fn directory() -> HashMap<String, u64> {
        [("http://cn1", 1), ("http://cn2", 2), ("http://cn3", 3), ("http://cn4", 4)]
            .into_iter()
            .map(|(e, id)| (e.to_string(), id))
            .collect()
    }

    fn ctx<'a>(
        self_endpoint: &'a str,
        unhealthy: &'a BTreeSet<String>,
        directory: &'a HashMap<String, u64>,
        metrics: &'a SecondaryMetrics,
    ) -> NecessityContext<'a> {
        NecessityContext {
            self_endpoint,
            unhealthy_peers: unhealthy,
            directory,
            metrics,
            thresholds: ReconfigThresholds::default(),
        }
    }

    #[tokio::test]
    async fn test_primary_healthy_secondaries_get_sync_candidates() {
        let user = node_user(1, "0xabc", ["http://cn1", "http://cn2", "http://cn3"], [1, 2, 3]);
        let (unhealthy, dir, metrics) = (BTreeSet::new(), directory(), HashMap::new());
        let decision = evaluate_user(&user, &ctx("http://cn1", &unhealthy, &dir, &metrics), &FixedPrimary(true))
            .await
            .unwrap();

        assert_eq!(decision.potential_syncs.len(), 2);
        assert!(decision.reconfig.is_none());
    }

    #[tokio::test]
    async fn test_flagged_secondary_is_never_a_sync_candidate() {
        let user = node_user(1, "0xabc", ["http://cn1", "http://cn2", "http://cn3"], [1, 2, 3]);
        let unhealthy: BTreeSet<String> = ["http://cn2".to_string()].into();
        let (dir, metrics) = (directory(), HashMap::new());
        let decision = evaluate_user(&user, &ctx("http://cn1", &unhealthy, &dir, &metrics), &FixedPrimary(true))
            .await
            .unwrap();

        assert_eq!(decision.potential_syncs.len(), 1);
        assert_eq!(decision.potential_syncs[0].secondary, "http://cn3");
        let op = decision.reconfig.unwrap();
        assert_eq!(op.unhealthy_replicas.into_iter().collect::<Vec<_>>(), vec!["http://cn2"]);
    }

    #[tokio::test]
    async fn test_provider_mismatch_and_sync_failures_flag_secondaries() {
        // Directory says cn2 is provider 2, discovery claims 9
        let user = node_user(1, "0xabc", ["http://cn1", "http://cn2", "http://cn3"], [1, 9, 3]);
        let unhealthy = BTreeSet::new();
        let dir = directory();
        let mut metrics = HashMap::new();
        metrics.insert(
            ("http://cn3".to_string(), "0xabc".to_string()),
            SyncMetrics { success_count: 5, failure_count: 25 },
        );
        let decision = evaluate_user(&user, &ctx("http://cn1", &unhealthy, &dir, &metrics), &FixedPrimary(true))
            .await
            .unwrap();

        assert!(decision.potential_syncs.is_empty());
        assert_eq!(decision.reconfig.unwrap().unhealthy_replicas.len(), 2);
    }

    #[tokio::test]
    async fn test_many_failures_with_good_rate_are_tolerated() {
        let user = node_user(1, "0xabc", ["http://cn1", "http://cn2", ""], [1, 2, 0]);
        let (unhealthy, dir) = (BTreeSet::new(), directory());
        let mut metrics = HashMap::new();
        metrics.insert(
            ("http://cn2".to_string(), "0xabc".to_string()),
            SyncMetrics { success_count: 100, failure_count: 25 },
        );
        let decision = evaluate_user(&user, &ctx("http://cn1", &unhealthy, &dir, &metrics), &FixedPrimary(true))
            .await
            .unwrap();
        assert_eq!(decision.potential_syncs.len(), 1);
        assert!(decision.reconfig.is_none());
    }

    #[tokio::test]
    async fn test_secondary_respects_primary_grace_period() {
        let user = node_user(1, "0xabc", ["http://cn1", "http://cn2", "http://cn3"], [1, 2, 3]);
        let unhealthy: BTreeSet<String> = ["http://cn1".to_string(), "http://cn3".to_string()].into();
        let (dir, metrics) = (directory(), HashMap::new());
        let context = ctx("http://cn2", &unhealthy, &dir, &metrics);

        let within_grace = evaluate_user(&user, &context, &FixedPrimary(true)).await.unwrap();
        assert!(within_grace.potential_syncs.is_empty());
        assert_eq!(
            within_grace.reconfig.unwrap().unhealthy_replicas.into_iter().collect::<Vec<_>>(),
            vec!["http://cn3"]
        );

        let confirmed = evaluate_user(&user, &context, &FixedPrimary(false)).await.unwrap();
        assert_eq!(confirmed.reconfig.unwrap().unhealthy_replicas.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_directory_skips_provider_checks() {
        let user = node_user(1, "0xabc", ["http://cn1", "http://cn2", "http://cn3"], [1, 9, 9]);
        let (unhealthy, dir, metrics) = (BTreeSet::new(), HashMap::new(), HashMap::new());
        let decision = evaluate_user(&user, &ctx("http://cn1", &unhealthy, &dir, &metrics), &FixedPrimary(true))
            .await
            .unwrap();
        assert_eq!(decision.potential_syncs.len(), 2);
    }

    #[tokio::test]
    async fn test_aggregate_skips_users_without_self() {
        let users = vec![
            node_user(1, "0x1", ["http://cn1", "http://cn2", "http://cn3"], [1, 2, 3]),
            node_user(2, "0x2", ["http://cn2", "http://cn3", "http://cn4"], [2, 3, 4]),
            node_user(3, "0x3", ["http://cn1", "http://cn4", ""], [1, 4, 0]),
        ];
        let unhealthy: BTreeSet<String> = ["http://cn4".to_string()].into();
        let (dir, metrics) = (directory(), HashMap::new());
        let result = aggregate(
            &users,
            &ctx("http://cn1", &unhealthy, &dir, &metrics),
            &FixedPrimary(true),
            2,
            4,
        )
        .await;

        assert_eq!(result.failed_users, 1);
        assert_eq!(result.potential_syncs.len(), 2);
        assert_eq!(result.reconfig_ops.len(), 1);
        assert_eq!(result.reconfig_ops[0].user_id, 3);
    }

    fn scheduler() -> SyncScheduler {
        let client = Arc::new(FakePeers::new()) as Arc<dyn PeerClient>;
        let history = Arc::new(SyncHistory::in_memory().unwrap());
        let monitor = Arc::new(SyncMonitor::new(
            Arc::clone(&client),
            Arc::new(PeerClockStore::new(Arc::clone(&client), "http://cn1")),
            history,
            "http://cn1",
            MonitorSettings::default(),
        ));
        SyncScheduler::new(monitor, client, "http://cn1", 1, 1, false)
    }

    fn clocks(entries: &[(&str, &str, i64)]) -> ReplicaClocks {
        let mut clocks = ReplicaClocks::new();
        for (replica, wallet, clock) in entries {
            clocks
                .entry(replica.to_string())
                .or_default()
                .insert(wallet.to_string(), *clock);
        }
        clocks
    }

    #[test]
    fn test_syncs_only_issued_when_primary_is_ahead() {
        let scheduler = scheduler();
        let potential = vec![
            SyncRequest::recurring("0xahead", "http://cn1", "http://cn2"),
            SyncRequest::recurring("0xequal", "http://cn1", "http://cn2"),
            SyncRequest::recurring("0xbehind", "http://cn1", "http://cn2"),
            SyncRequest::recurring("0xempty", "http://cn1", "http://cn2"),
            SyncRequest::recurring("0xunfetched", "http://cn1", "http://cn3"),
            SyncRequest::recurring("0xforeign", "http://cn4", "http://cn2"),
        ];
        let clocks = clocks(&[
            ("http://cn1", "0xahead", 9),
            ("http://cn2", "0xahead", 3),
            ("http://cn1", "0xequal", 5),
            ("http://cn2", "0xequal", 5),
            ("http://cn1", "0xbehind", 2),
            ("http://cn2", "0xbehind", 6),
            ("http://cn1", "0xempty", -1),
            ("http://cn1", "0xunfetched", 4),
            ("http://cn4", "0xforeign", 50),
            ("http://cn2", "0xforeign", 1),
        ]);

        let report = issue_sync_requests(&potential, &clocks, "http://cn1", &scheduler);
        assert_eq!((report.required, report.enqueued, report.errors), (2, 2, 0));

        let mut queued: Vec<(String, String)> = scheduler
            .queue_jobs()
            .recurring_waiting
            .into_iter()
            .map(|job| (job.request.wallet, job.request.secondary))
            .collect();
        queued.sort();
        assert_eq!(
            queued,
            vec![
                ("0xahead".to_string(), "http://cn2".to_string()),
                ("0xunfetched".to_string(), "http://cn3".to_string()),
            ]
        );
    }

    #[test]
    fn test_unknown_primary_clock_never_syncs() {
        let scheduler = scheduler();
        let potential = vec![SyncRequest::recurring("0xa", "http://cn1", "http://cn2")];

        let report = issue_sync_requests(&potential, &ReplicaClocks::new(), "http://cn1", &scheduler);
        assert_eq!(report.required, 0);
        assert!(scheduler.queue_jobs().recurring_waiting.is_empty());
    }
}
