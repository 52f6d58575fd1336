//! Assignment Authority
//!
//! The authoritative registry of replica-set assignments and registered
//! content nodes. Reached through an HTTP gateway in production.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peer::DataEnvelope;

/// Registered content node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProvider {
    pub endpoint: String,
    #[serde(rename = "spID")]
    pub sp_id: u64,
}

/// Registry of replica-set assignments
#[async_trait]
pub trait AssignmentAuthority: Send + Sync {
    /// Write a new replica set for a user
    async fn update_replica_set(&self, user_id: u64, primary_sp_id: u64, secondary_sp_ids: [u64; 2]) -> Result<()>;

    /// All registered content nodes
    async fn service_providers(&self) -> Result<Vec<ServiceProvider>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateReplicaSetRequest {
    primary: u64,
    secondaries: [u64; 2],
}

/// HTTP adapter for the registry gateway
pub struct HttpAuthority {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl AssignmentAuthority for HttpAuthority {
    async fn update_replica_set(&self, user_id: u64, primary_sp_id: u64, secondary_sp_ids: [u64; 2]) -> Result<()> {
        let url = format!("{}/replica_sets/{}", self.base_url, user_id);
        let response = self
            .client
            .post(&url)
            .json(&UpdateReplicaSetRequest {
                primary: primary_sp_id,
                secondaries: secondary_sp_ids,
            })
            .send()
            .await
            .map_err(|e| Error::AuthorityWrite {
                user_id,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthorityWrite {
                user_id,
                reason: format!("{}: {}", status, body),
            });
        }
        Ok(())
    }

    async fn service_providers(&self) -> Result<Vec<ServiceProvider>> {
        let url = format!("{}/service_providers", self.base_url);
        let envelope: DataEnvelope<Vec<ServiceProvider>> = self
            .client
            .get(&url)
            .query(&[("type", "content-node")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }
}
