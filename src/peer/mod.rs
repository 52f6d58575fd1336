//! Peer Module
//!
//! HTTP collaborators: other content nodes and the discovery node.

mod client;
mod discovery;
mod signing;

pub use client::{
    BatchClockStatusRequest, BatchClockStatusResponse, ClockStatus, HttpPeerClient, PeerClient, PeerTimeouts,
    SyncPayload, VerboseHealth, WalletClock,
};
pub use discovery::{fetch_all_node_users, HttpUserDirectory, UserDirectory};
pub use signing::{RequestSigner, SignedParams};

use serde::{Deserialize, Serialize};

/// Content-node responses wrap their payload in `{ "data": ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}
