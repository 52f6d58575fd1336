//! Reconcile Module
//!
//! The periodic reconciliation pass: peer health, replica clocks, sync
//! necessity and replica-set reconfiguration.

mod clock;
mod health;
mod necessity;
mod orchestrator;
mod reconfig;
mod selector;
mod trail;

pub use clock::{build_replica_to_wallets, clock_for, ClockFetch, ClockStatusOracle, ReplicaClocks};
pub use health::{
    compute_peer_set, evaluate_verbose_health, HealthThresholds, HealthViolation, PeerHealthEvaluator,
    PrimaryHealthCheck,
};
pub use necessity::{
    aggregate, compute_secondary_metrics, evaluate_user, issue_sync_requests, Aggregate, NecessityContext,
    ReconfigThresholds, SecondaryMetrics, SyncIssueReport, UserDecision,
};
pub use orchestrator::{slice_users, Collaborators, Orchestrator, OrchestratorSettings, PassReport};
pub use reconfig::{plan, NewReplicaSet, ReconfigExecutor, ReconfigOutcome, ReconfigPhase, ReplicaSetPlan};
pub use selector::ReplicaSetSelector;
pub use trail::{DecisionTrail, TrailEntry};
