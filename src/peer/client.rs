//! Peer Client
//!
//! HTTP client for the content-node routes the reconciliation engine
//! consumes: verbose health, single and batch clock status, and sync.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::signing::RequestSigner;
use super::DataEnvelope;
use crate::config::SnapbackConfig;
use crate::error::{Error, Result};
use crate::model::SyncType;

/// Body of `GET /health_check/verbose`. Fields older nodes do not report
/// are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerboseHealth {
    #[serde(default)]
    pub storage_path_size: Option<u64>,
    #[serde(default)]
    pub storage_path_used: Option<u64>,
    #[serde(default)]
    pub used_memory: Option<u64>,
    #[serde(default)]
    pub total_memory: Option<u64>,
    #[serde(default)]
    pub allocated_file_descriptors: Option<u64>,
    #[serde(default)]
    pub max_file_descriptors: Option<u64>,
    #[serde(default)]
    pub daily_sync_success_count: Option<u64>,
    #[serde(default)]
    pub daily_sync_fail_count: Option<u64>,
    #[serde(default)]
    pub thirty_day_rolling_sync_success_count: Option<u64>,
    #[serde(default)]
    pub thirty_day_rolling_sync_fail_count: Option<u64>,
}

/// Body of `GET /users/clock_status/{wallet}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockStatus {
    pub clock_value: i64,
    #[serde(default)]
    pub sync_in_progress: bool,
}

/// One entry of `POST /users/batch_clock_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletClock {
    pub wallet_public_key: String,
    pub clock: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchClockStatusRequest {
    pub wallet_public_keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchClockStatusResponse {
    pub users: Vec<WalletClock>,
}

/// Body of `POST /sync`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub wallet: Vec<String>,
    pub creator_node_endpoint: String,
    pub sync_type: SyncType,
    pub immediate: bool,
}

/// Content-node wire protocol
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn verbose_health(&self, endpoint: &str) -> Result<VerboseHealth>;

    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<ClockStatus>;

    async fn batch_clock_status(&self, endpoint: &str, wallets: &[String]) -> Result<Vec<WalletClock>>;

    async fn request_sync(&self, secondary: &str, payload: &SyncPayload) -> Result<()>;
}

/// Per-route timeouts
#[derive(Debug, Clone, Copy)]
pub struct PeerTimeouts {
    pub health: Duration,
    pub clock_status: Duration,
    pub batch_clock_status: Duration,
    pub sync: Duration,
}

impl PeerTimeouts {
    pub fn from_config(config: &SnapbackConfig) -> Self {
        Self {
            health: Duration::from_millis(config.health.peer_health_check_timeout_ms),
            clock_status: Duration::from_millis(config.reconfig.clock_status_timeout_ms),
            batch_clock_status: Duration::from_millis(config.sync.batch_clock_status_timeout_ms),
            sync: Duration::from_millis(config.sync.request_timeout_ms),
        }
    }
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(2),
            clock_status: Duration::from_secs(2),
            batch_clock_status: Duration::from_secs(10),
            sync: Duration::from_secs(10),
        }
    }
}

/// reqwest-backed peer client
pub struct HttpPeerClient {
    client: reqwest::Client,
    signer: RequestSigner,
    timeouts: PeerTimeouts,
}

impl HttpPeerClient {
    pub fn new(signer: RequestSigner, timeouts: PeerTimeouts) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            signer,
            timeouts,
        })
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), path)
    }

    fn map_err(endpoint: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::PeerTimeout(endpoint.to_string())
        } else if e.is_decode() {
            Error::DataInconsistency(format!("malformed response from {}: {}", endpoint, e))
        } else {
            Error::peer(endpoint, e)
        }
    }

    async fn send(&self, endpoint: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| Self::map_err(endpoint, e))?;
        if !response.status().is_success() {
            return Err(Error::peer(endpoint, format!("HTTP {}", response.status())));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, endpoint: &str, request: reqwest::RequestBuilder) -> Result<T> {
        let envelope: DataEnvelope<T> = self
            .send(endpoint, request)
            .await?
            .json()
            .await
            .map_err(|e| Self::map_err(endpoint, e))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn verbose_health(&self, endpoint: &str) -> Result<VerboseHealth> {
        let request = self
            .client
            .get(Self::url(endpoint, "/health_check/verbose"))
            .timeout(self.timeouts.health);
        self.send_json(endpoint, request).await
    }

    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<ClockStatus> {
        let request = self
            .client
            .get(Self::url(endpoint, &format!("/users/clock_status/{}", wallet)))
            .timeout(self.timeouts.clock_status);
        self.send_json(endpoint, request).await
    }

    async fn batch_clock_status(&self, endpoint: &str, wallets: &[String]) -> Result<Vec<WalletClock>> {
        let request = self
            .client
            .post(Self::url(endpoint, "/users/batch_clock_status"))
            .query(&self.signer.sign())
            .json(&BatchClockStatusRequest {
                wallet_public_keys: wallets.to_vec(),
            })
            .timeout(self.timeouts.batch_clock_status);
        let response: BatchClockStatusResponse = self.send_json(endpoint, request).await?;
        Ok(response.users)
    }

    async fn request_sync(&self, secondary: &str, payload: &SyncPayload) -> Result<()> {
        let request = self
            .client
            .post(Self::url(secondary, "/sync"))
            .query(&self.signer.sign())
            .json(payload)
            .timeout(self.timeouts.sync);
        self.send(secondary, request).await?;
        Ok(())
    }
}
