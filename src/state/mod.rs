//! State Management Module
//!
//! State that outlives a single reconciliation pass: primary grace-period
//! timestamps, sync outcome history and the replica directory.

mod directory;
mod health;
mod history;

pub use directory::ReplicaDirectory;
pub use health::{NodeHealthStore, PrimaryHealth};
pub use history::{HistorySummary, SyncHistory, SyncMetrics, SyncOutcomeKind, ROLLING_WINDOW_DAYS};
