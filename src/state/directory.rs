//! Replica Directory
//!
//! Endpoint to provider-ID mapping for every registered content node,
//! refreshed from the assignment authority each pass.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::authority::AssignmentAuthority;
use crate::error::{Error, Result};

/// Endpoint to provider-ID mapping
pub struct ReplicaDirectory {
    entries: RwLock<HashMap<String, u64>>,
}

impl ReplicaDirectory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Seeded directory, mostly for tests
    pub fn with_entries(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Refresh from the authority. On failure, or when the authority
    /// returns nothing, the previous mapping is kept and an error is
    /// returned so the caller can disable reconfig for this pass.
    pub async fn refresh(&self, authority: &dyn AssignmentAuthority) -> Result<usize> {
        let providers = authority.service_providers().await.map_err(|e| {
            tracing::warn!("Replica directory refresh failed, keeping stale mapping: {}", e);
            e
        })?;

        if providers.is_empty() {
            tracing::warn!("Authority returned no service providers, keeping stale mapping");
            return Err(Error::DataInconsistency("empty service provider list".into()));
        }

        let fresh: HashMap<String, u64> = providers
            .into_iter()
            .map(|sp| (sp.endpoint, sp.sp_id))
            .collect();
        let count = fresh.len();
        *self.entries.write().await = fresh;
        tracing::debug!("Replica directory refreshed with {} providers", count);
        Ok(count)
    }

    pub async fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.entries.read().await.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    pub async fn snapshot(&self) -> HashMap<String, u64> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for ReplicaDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::ServiceProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyAuthority {
        fail: AtomicBool,
        providers: Vec<ServiceProvider>,
    }

    #[async_trait]
    impl AssignmentAuthority for FlakyAuthority {
        async fn update_replica_set(&self, _: u64, _: u64, _: [u64; 2]) -> Result<()> {
            Ok(())
        }

        async fn service_providers(&self) -> Result<Vec<ServiceProvider>> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::peer("http://registry", "unreachable"))
            } else {
                Ok(self.providers.clone())
            }
        }
    }

    #[tokio::test]
    async fn test_refresh_keeps_stale_mapping_on_failure() {
        let authority = FlakyAuthority {
            fail: AtomicBool::new(false),
            providers: vec![
                ServiceProvider { endpoint: "http://cn1".into(), sp_id: 1 },
                ServiceProvider { endpoint: "http://cn2".into(), sp_id: 2 },
            ],
        };
        let directory = ReplicaDirectory::new();

        assert_eq!(directory.refresh(&authority).await.unwrap(), 2);
        assert_eq!(directory.snapshot().await.get("http://cn2").copied(), Some(2));

        authority.fail.store(true, Ordering::SeqCst);
        assert!(directory.refresh(&authority).await.is_err());
        assert_eq!(directory.len().await, 2);
        assert_eq!(directory.endpoints().await, vec!["http://cn1", "http://cn2"]);
    }

    #[tokio::test]
    async fn test_empty_provider_list_is_an_error() {
        let authority = FlakyAuthority {
            fail: AtomicBool::new(false),
            providers: vec![],
        };
        let directory = ReplicaDirectory::with_entries([("http://cn1".to_string(), 1)]);
        assert!(directory.refresh(&authority).await.is_err());
        assert_eq!(directory.snapshot().await.get("http://cn1").copied(), Some(1));
    }
}
