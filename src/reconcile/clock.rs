//! Clock Status Oracle
//!
//! Batch-fetches every replica's clock value for the users in a pass.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use futures::FutureExt;

use crate::model::{NodeUser, UNKNOWN_CLOCK};
use crate::peer::PeerClient;
use crate::retry::{retry, RetryPolicy};

/// replica endpoint -> wallet -> clock
pub type ReplicaClocks = HashMap<String, HashMap<String, i64>>;

/// Clock value for `wallet` on `replica`; -1 when not fetched
pub fn clock_for(clocks: &ReplicaClocks, replica: &str, wallet: &str) -> i64 {
    clocks
        .get(replica)
        .and_then(|wallets| wallets.get(wallet))
        .copied()
        .unwrap_or(UNKNOWN_CLOCK)
}

/// replica endpoint -> wallets it holds, for every populated slot
pub fn build_replica_to_wallets(users: &[NodeUser]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for user in users {
        for (_, info) in user.replicas() {
            map.entry(info.endpoint.clone()).or_default().push(user.wallet.clone());
        }
    }
    map
}

/// Clocks fetched in one pass plus replicas that never answered
#[derive(Debug, Default)]
pub struct ClockFetch {
    pub clocks: ReplicaClocks,
    pub unhealthy: BTreeSet<String>,
}

/// Fetches clocks from replicas
pub struct ClockStatusOracle {
    client: Arc<dyn PeerClient>,
    batch_size: usize,
    retry_policy: RetryPolicy,
    concurrency: usize,
}

impl ClockStatusOracle {
    pub fn new(client: Arc<dyn PeerClient>, batch_size: usize, retry_policy: RetryPolicy, concurrency: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            retry_policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Replicas are queried in parallel, batches within a replica in
    /// sequence. A replica whose batch exhausts its retries is reported
    /// unhealthy and that batch contributes no clocks.
    pub async fn fetch_clocks(&self, replica_to_wallets: &HashMap<String, Vec<String>>) -> ClockFetch {
        let futures: Vec<_> = replica_to_wallets
            .iter()
            .map(|(replica, wallets)| {
                async move {
                    let (clocks, failed) = self.fetch_replica(replica, wallets).await;
                    (replica.clone(), clocks, failed)
                }
                .boxed()
            })
            .collect();
        let results: Vec<(String, HashMap<String, i64>, bool)> = stream::iter(futures)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut fetch = ClockFetch::default();
        for (replica, clocks, failed) in results {
            if failed {
                fetch.unhealthy.insert(replica.clone());
            }
            fetch.clocks.insert(replica, clocks);
        }
        fetch
    }

    async fn fetch_replica(&self, replica: &str, wallets: &[String]) -> (HashMap<String, i64>, bool) {
        let mut clocks = HashMap::with_capacity(wallets.len());
        let mut failed = false;

        for batch in wallets.chunks(self.batch_size) {
            let label = format!("batch_clock_status {}", replica);
            let result = retry(&self.retry_policy, &label, |_| self.client.batch_clock_status(replica, batch)).await;

            match result {
                Ok(entries) => {
                    for entry in entries {
                        clocks.insert(entry.wallet_public_key, entry.clock);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to fetch clocks for {} wallets from {}: {}",
                        batch.len(),
                        replica,
                        e
                    );
                    failed = true;
                }
            }
        }

        (clocks, failed)
    }
}
