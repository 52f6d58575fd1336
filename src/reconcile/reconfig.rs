//! Replica Set Reconfiguration
//!
//! Turns a `ReconfigOp` into a new replica set, gates it on the configured
//! reconfig mode, writes it to the assignment authority and schedules
//! catch-up syncs from the new primary.
//!
//! | Unhealthy                | New primary                  | Required mode              |
//! |--------------------------|------------------------------|----------------------------|
//! | one secondary            | unchanged                    | ONE_SECONDARY              |
//! | both secondaries         | unchanged                    | MULTIPLE_SECONDARIES       |
//! | primary                  | higher-clock secondary       | PRIMARY_AND_OR_SECONDARIES |
//! | primary and a secondary  | the healthy secondary        | PRIMARY_AND_OR_SECONDARIES |
//! | all three                | none, never executed         | ENTIRE_REPLICA_SET         |

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use super::clock::{clock_for, ReplicaClocks};
use super::selector::ReplicaSetSelector;
use crate::authority::AssignmentAuthority;
use crate::error::{Error, Result};
use crate::model::{ReconfigMode, ReconfigOp, SyncRequest};
use crate::sync::SyncScheduler;

/// Step an op failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconfigPhase {
    DetermineNewReplicaSet,
    UpdateReplicaSet,
    EnqueueSyncs,
}

impl std::fmt::Display for ReconfigPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconfigPhase::DetermineNewReplicaSet => write!(f, "DETERMINE_NEW_REPLICA_SET"),
            ReconfigPhase::UpdateReplicaSet => write!(f, "UPDATE_REPLICA_SET"),
            ReconfigPhase::EnqueueSyncs => write!(f, "ENQUEUE_SYNCS"),
        }
    }
}

/// Shape of the new replica set before replacements are chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetPlan {
    pub mode: ReconfigMode,
    pub primary: Option<String>,
    /// Current healthy secondaries that stay on, in slot order
    pub kept_secondaries: Vec<String>,
    /// Replacements to select
    pub needed: usize,
}

/// Plan the new replica set for `op`. When only the primary is unhealthy
/// the secondary with the higher clock is promoted, secondary1 on a tie.
pub fn plan(op: &ReconfigOp, clocks: &ReplicaClocks) -> Result<ReplicaSetPlan> {
    if op.unhealthy_replicas.is_empty() {
        return Err(Error::DataInconsistency(format!("user {} has no unhealthy replicas", op.user_id)));
    }

    let healthy_secondaries: Vec<String> = [op.secondary1.as_deref(), op.secondary2.as_deref()]
        .into_iter()
        .flatten()
        .filter(|s| !op.is_unhealthy(Some(*s)))
        .map(str::to_string)
        .collect();

    let primary = match op.primary.as_deref() {
        Some(primary) => primary,
        None => return Err(Error::DataInconsistency(format!("user {} has no primary", op.user_id))),
    };

    if !op.is_unhealthy(Some(primary)) {
        if healthy_secondaries.len() == 2 {
            return Err(Error::DataInconsistency(format!(
                "user {} unhealthy replicas {:?} are not in its replica set",
                op.user_id, op.unhealthy_replicas
            )));
        }
        return Ok(ReplicaSetPlan {
            mode: if healthy_secondaries.is_empty() {
                ReconfigMode::MultipleSecondaries
            } else {
                ReconfigMode::OneSecondary
            },
            primary: Some(primary.to_string()),
            needed: 2 - healthy_secondaries.len(),
            kept_secondaries: healthy_secondaries,
        });
    }

    match healthy_secondaries.as_slice() {
        [] => Ok(ReplicaSetPlan {
            mode: ReconfigMode::EntireReplicaSet,
            primary: None,
            kept_secondaries: Vec::new(),
            needed: 0,
        }),
        [only] => Ok(ReplicaSetPlan {
            mode: ReconfigMode::PrimaryAndOrSecondaries,
            primary: Some(only.clone()),
            kept_secondaries: Vec::new(),
            needed: 2,
        }),
        [first, second, ..] => {
            let (promoted, kept) = if clock_for(clocks, first, &op.wallet) >= clock_for(clocks, second, &op.wallet) {
                (first, second)
            } else {
                (second, first)
            };
            Ok(ReplicaSetPlan {
                mode: ReconfigMode::PrimaryAndOrSecondaries,
                primary: Some(promoted.clone()),
                kept_secondaries: vec![kept.clone()],
                needed: 1,
            })
        }
    }
}

fn current_set(op: &ReconfigOp) -> String {
    format!(
        "[{},{},{}]",
        op.primary.as_deref().unwrap_or(""),
        op.secondary1.as_deref().unwrap_or(""),
        op.secondary2.as_deref().unwrap_or("")
    )
}

/// A full replacement replica set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewReplicaSet {
    pub primary: String,
    pub secondary1: String,
    pub secondary2: String,
}

impl NewReplicaSet {
    fn endpoints(&self) -> [&str; 3] {
        [&self.primary, &self.secondary1, &self.secondary2]
    }
}

impl std::fmt::Display for NewReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{},{}]", self.primary, self.secondary1, self.secondary2)
    }
}

/// Result of one reconfig attempt. Errors are reported here, never raised.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconfigOutcome {
    pub user_id: u64,
    pub issued_reconfig: bool,
    pub mode: Option<ReconfigMode>,
    pub new_replica_set: Option<NewReplicaSet>,
    pub error_msg: Option<String>,
}

/// Executes reconfig ops one at a time
pub struct ReconfigExecutor {
    selector: ReplicaSetSelector,
    authority: Arc<dyn AssignmentAuthority>,
    scheduler: Arc<SyncScheduler>,
}

impl ReconfigExecutor {
    pub fn new(
        selector: ReplicaSetSelector,
        authority: Arc<dyn AssignmentAuthority>,
        scheduler: Arc<SyncScheduler>,
    ) -> Self {
        Self {
            selector,
            authority,
            scheduler,
        }
    }

    pub async fn issue_update_replica_set_op(
        &self,
        op: &ReconfigOp,
        healthy_pool: &[String],
        clocks: &ReplicaClocks,
        directory: &HashMap<String, u64>,
        highest_mode: ReconfigMode,
    ) -> ReconfigOutcome {
        let mut outcome = ReconfigOutcome {
            user_id: op.user_id,
            ..Default::default()
        };
        let mut phase = ReconfigPhase::DetermineNewReplicaSet;

        tracing::info!(
            "Reconfig for user {} wallet {}: unhealthy {:?}, {} healthy nodes",
            op.user_id,
            op.wallet,
            op.unhealthy_replicas,
            healthy_pool.len()
        );

        if let Err(e) = self
            .execute(op, healthy_pool, clocks, directory, highest_mode, &mut phase, &mut outcome)
            .await
        {
            let msg = format!(
                "Reconfig [ERROR] user {} wallet {} phase {} old replica set {}: {}",
                op.user_id,
                op.wallet,
                phase,
                current_set(op),
                e
            );
            tracing::error!("{}", msg);
            outcome.error_msg = Some(msg);
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        op: &ReconfigOp,
        healthy_pool: &[String],
        clocks: &ReplicaClocks,
        directory: &HashMap<String, u64>,
        highest_mode: ReconfigMode,
        phase: &mut ReconfigPhase,
        outcome: &mut ReconfigOutcome,
    ) -> Result<()> {
        let plan = plan(op, clocks)?;
        outcome.mode = Some(plan.mode);

        let primary = match plan.primary {
            Some(primary) if plan.mode != ReconfigMode::EntireReplicaSet => primary,
            _ => {
                tracing::warn!(
                    "Entire replica set for user {} wallet {} is unhealthy, not reconfiguring",
                    op.user_id,
                    op.wallet
                );
                return Ok(());
            }
        };

        let current_healthy: BTreeSet<String> = [op.primary.as_deref(), op.secondary1.as_deref(), op.secondary2.as_deref()]
            .into_iter()
            .flatten()
            .filter(|e| !op.is_unhealthy(Some(*e)))
            .map(str::to_string)
            .collect();
        let replacements = self
            .selector
            .select(&current_healthy, plan.needed, healthy_pool, &op.wallet)
            .await?;

        let mut secondaries = plan.kept_secondaries.into_iter().chain(replacements);
        let (Some(secondary1), Some(secondary2)) = (secondaries.next(), secondaries.next()) else {
            return Err(Error::Internal(format!("incomplete replica set for user {}", op.user_id)));
        };
        let new_set = NewReplicaSet {
            primary,
            secondary1,
            secondary2,
        };
        outcome.new_replica_set = Some(new_set.clone());

        if !highest_mode.enables(plan.mode) {
            tracing::info!(
                "Reconfig [DISABLED] user {} wallet {}: {} -> {} requires {}, highest enabled {}",
                op.user_id,
                op.wallet,
                current_set(op),
                new_set,
                plan.mode,
                highest_mode
            );
            return Ok(());
        }

        *phase = ReconfigPhase::UpdateReplicaSet;
        let mut sp_ids = [0u64; 3];
        for (slot, endpoint) in sp_ids.iter_mut().zip(new_set.endpoints()) {
            *slot = directory.get(endpoint).copied().ok_or_else(|| {
                Error::DataInconsistency(format!("{} in new replica set {} is not a registered provider", endpoint, new_set))
            })?;
        }
        self.authority
            .update_replica_set(op.user_id, sp_ids[0], [sp_ids[1], sp_ids[2]])
            .await?;
        outcome.issued_reconfig = true;

        *phase = ReconfigPhase::EnqueueSyncs;
        for secondary in [&new_set.secondary1, &new_set.secondary2] {
            self.scheduler
                .enqueue_sync(SyncRequest::recurring(&op.wallet, &new_set.primary, secondary))?;
        }

        tracing::info!(
            "Reconfig [SUCCESS] user {} wallet {}: new replica set {} ({})",
            op.user_id,
            op.wallet,
            new_set,
            plan.mode
        );
        Ok(())
    }
}
