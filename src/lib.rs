//! Snapback - Content Node Replica Reconciliation
//!
//! A background engine run by every content node in a decentralized storage
//! network. Each user's data lives on a replica set of three nodes: a primary
//! and two secondaries. Snapback periodically reconciles the replica sets this
//! node participates in.
//!
//! # Architecture
//!
//! A state-machine loop walks one modulo slice of the node's users per pass.
//! For each user it checks peer health and replica clocks, enqueues sync
//! requests toward lagging secondaries, and replaces unhealthy replicas by
//! writing a new replica set to the assignment authority.
//!
//! # Features
//!
//! - Paged discovery of the users this node replicates
//! - Verbose peer health checks with a grace period for unhealthy primaries
//! - Batched clock status queries with retry
//! - Deduplicated manual and recurring sync queues with progress monitoring
//! - Mode-gated replica-set reconfiguration
//! - Per-pass decision trail and an introspection HTTP API

pub mod api;
pub mod authority;
pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod peer;
pub mod reconcile;
pub mod retry;
pub mod state;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::SnapbackConfig;
pub use error::{Error, Result};
pub use node::Snapback;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SnapbackConfig;
    pub use crate::error::{Error, Result};
    pub use crate::model::{NodeUser, ReconfigMode, ReconfigOp, SyncRequest, SyncType};
    pub use crate::node::Snapback;
    pub use crate::peer::{PeerClient, UserDirectory};
    pub use crate::reconcile::{Orchestrator, PassReport};
    pub use crate::sync::SyncScheduler;
}
