//! Local Clock Store
//!
//! Read access to this node's own per-user clock values.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::UNKNOWN_CLOCK;
use crate::peer::PeerClient;

/// Per-user clock values held by this node
#[async_trait]
pub trait ClockStore: Send + Sync {
    /// Clock for each wallet; unknown wallets map to -1
    async fn clock_values(&self, wallets: &[String]) -> Result<HashMap<String, i64>>;

    async fn clock_value(&self, wallet: &str) -> Result<i64> {
        let values = self.clock_values(&[wallet.to_string()]).await?;
        Ok(values.get(wallet).copied().unwrap_or(UNKNOWN_CLOCK))
    }
}

/// Reads clocks through this node's own batch clock route
pub struct PeerClockStore {
    client: Arc<dyn PeerClient>,
    self_endpoint: String,
}

impl PeerClockStore {
    pub fn new(client: Arc<dyn PeerClient>, self_endpoint: impl Into<String>) -> Self {
        Self {
            client,
            self_endpoint: self_endpoint.into(),
        }
    }
}

#[async_trait]
impl ClockStore for PeerClockStore {
    async fn clock_values(&self, wallets: &[String]) -> Result<HashMap<String, i64>> {
        let reported = self.client.batch_clock_status(&self.self_endpoint, wallets).await?;
        let mut values: HashMap<String, i64> =
            wallets.iter().map(|w| (w.clone(), UNKNOWN_CLOCK)).collect();
        for entry in reported {
            values.insert(entry.wallet_public_key, entry.clock);
        }
        Ok(values)
    }
}
