//! Replica Set Selector
//!
//! Picks replacement replicas for a user from the healthy node pool. A
//! candidate is only accepted when it holds no state for the user.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::model::UNKNOWN_CLOCK;
use crate::peer::PeerClient;

pub struct ReplicaSetSelector {
    client: Arc<dyn PeerClient>,
    max_attempts: u32,
}

impl ReplicaSetSelector {
    pub fn new(client: Arc<dyn PeerClient>, max_attempts: u32) -> Self {
        Self { client, max_attempts }
    }

    /// Randomly sample `needed` nodes from `pool`, skipping nodes already
    /// chosen or already in `healthy_replica_set`. A candidate is accepted
    /// when its clock for `wallet` is -1, or 0 with a warning.
    pub async fn select(
        &self,
        healthy_replica_set: &BTreeSet<String>,
        needed: usize,
        pool: &[String],
        wallet: &str,
    ) -> Result<Vec<String>> {
        let mut selected: Vec<String> = Vec::with_capacity(needed);
        let mut attempts = 0;

        while selected.len() < needed && attempts < self.max_attempts {
            attempts += 1;

            let Some(candidate) = pool.choose(&mut rand::thread_rng()).cloned() else {
                break;
            };
            if selected.contains(&candidate) || healthy_replica_set.contains(&candidate) {
                continue;
            }

            match self.client.clock_status(&candidate, wallet).await {
                Ok(status) if status.clock_value == UNKNOWN_CLOCK => selected.push(candidate),
                Ok(status) if status.clock_value == 0 => {
                    tracing::warn!("Candidate {} has clock 0 for {}, selecting anyway", candidate, wallet);
                    selected.push(candidate);
                }
                Ok(status) => {
                    tracing::debug!(
                        "Candidate {} already holds state for {} at clock {}",
                        candidate,
                        wallet,
                        status.clock_value
                    );
                }
                Err(e) => tracing::error!("Clock check of candidate {} for {} failed: {}", candidate, wallet, e),
            }
        }

        if selected.len() < needed {
            return Err(Error::InsufficientReplicas {
                selected: selected.len(),
                needed,
                attempts,
            });
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePeers;

    fn pool(endpoints: &[&str]) -> Vec<String> {
        endpoints.iter().map(|e| e.to_string()).collect()
    }

    fn healthy(endpoints: &[&str]) -> BTreeSet<String> {
        endpoints.iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test]
    async fn test_selects_distinct_stateless_nodes() {
        let peers = Arc::new(FakePeers::new());
        peers.set_clock("http://cn5", "0xabc", 0);
        let selector = ReplicaSetSelector::new(peers, 100);

        let chosen = selector
            .select(
                &healthy(&["http://cn1"]),
                2,
                &pool(&["http://cn1", "http://cn4", "http://cn5"]),
                "0xabc",
            )
            .await
            .unwrap();

        let mut sorted = chosen.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["http://cn4", "http://cn5"]);
    }

    #[tokio::test]
    async fn test_rejects_nodes_with_state_or_failed_queries() {
        let peers = Arc::new(FakePeers::new());
        peers.set_clock("http://cn4", "0xabc", 12);
        peers.fail_clock_queries("http://cn5");
        let selector = ReplicaSetSelector::new(peers, 50);

        let result = selector
            .select(
                &healthy(&["http://cn1"]),
                1,
                &pool(&["http://cn1", "http://cn4", "http://cn5"]),
                "0xabc",
            )
            .await;

        match result {
            Err(Error::InsufficientReplicas { selected, needed, attempts }) => {
                assert_eq!(selected, 0);
                assert_eq!(needed, 1);
                assert_eq!(attempts, 50);
            }
            other => panic!("expected InsufficientReplicas, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_pool_fails_fast() {
        let selector = ReplicaSetSelector::new(Arc::new(FakePeers::new()), 100);
        let result = selector.select(&BTreeSet::new(), 1, &[], "0xabc").await;
        assert!(matches!(result, Err(Error::InsufficientReplicas { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_nothing_needed() {
        let selector = ReplicaSetSelector::new(Arc::new(FakePeers::new()), 100);
        assert!(selector.select(&BTreeSet::new(), 0, &[], "0xabc").await.unwrap().is_empty());
    }
}
