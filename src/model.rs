//! Replication Model
//!
//! Types shared by the reconciliation pipeline: replica-set records as
//! reported by discovery, sync requests, reconfig operations and the
//! ordered reconfig modes that gate them.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Clock value reported for a user that a node has no record of
pub const UNKNOWN_CLOCK: i64 = -1;

/// Kind of sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncType {
    /// Triggered by a user write on the primary
    #[serde(rename = "MANUAL")]
    Manual,
    /// Issued by the periodic reconciliation pass
    #[serde(rename = "RECURRING")]
    Recurring,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Manual => "MANUAL",
            SyncType::Recurring => "RECURRING",
        }
    }
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MANUAL" => Ok(SyncType::Manual),
            "RECURRING" => Ok(SyncType::Recurring),
            other => Err(Error::State(format!("unknown sync type {}", other))),
        }
    }
}

/// Reconfiguration modes, totally ordered. A configured mode enables itself
/// and every mode below it except `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReconfigMode {
    #[serde(rename = "RECONFIG_DISABLED")]
    Disabled,
    #[serde(rename = "ONE_SECONDARY")]
    OneSecondary,
    #[serde(rename = "MULTIPLE_SECONDARIES")]
    MultipleSecondaries,
    #[serde(rename = "PRIMARY_AND_OR_SECONDARIES")]
    PrimaryAndOrSecondaries,
    #[serde(rename = "ENTIRE_REPLICA_SET")]
    EntireReplicaSet,
}

impl ReconfigMode {
    pub const ALL: [ReconfigMode; 5] = [
        ReconfigMode::Disabled,
        ReconfigMode::OneSecondary,
        ReconfigMode::MultipleSecondaries,
        ReconfigMode::PrimaryAndOrSecondaries,
        ReconfigMode::EntireReplicaSet,
    ];

    /// Parse a configured mode, falling back to `Disabled`
    pub fn parse_or_disabled(s: &str) -> Self {
        match s.parse() {
            Ok(mode) => mode,
            Err(_) => {
                tracing::warn!("Unrecognized reconfig mode '{}', reconfig disabled", s);
                ReconfigMode::Disabled
            }
        }
    }

    /// Whether `required` may execute when `self` is the highest enabled mode
    pub fn enables(&self, required: ReconfigMode) -> bool {
        *self != ReconfigMode::Disabled && required != ReconfigMode::Disabled && required <= *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconfigMode::Disabled => "RECONFIG_DISABLED",
            ReconfigMode::OneSecondary => "ONE_SECONDARY",
            ReconfigMode::MultipleSecondaries => "MULTIPLE_SECONDARIES",
            ReconfigMode::PrimaryAndOrSecondaries => "PRIMARY_AND_OR_SECONDARIES",
            ReconfigMode::EntireReplicaSet => "ENTIRE_REPLICA_SET",
        }
    }
}

impl std::fmt::Display for ReconfigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReconfigMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ReconfigMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown reconfig mode {}", s)))
    }
}

/// Provider ID claimed by discovery for a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderClaim {
    Verified(u64),
    /// Legacy discovery nodes omit provider IDs
    Unreported,
}

/// One slot of a replica set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub endpoint: String,
    pub provider: ProviderClaim,
}

impl ReplicaInfo {
    pub fn new(endpoint: impl Into<String>, provider: ProviderClaim) -> Self {
        Self {
            endpoint: endpoint.into(),
            provider,
        }
    }

    /// True when the claimed provider ID disagrees with the directory
    /// entry for this endpoint. An endpoint missing from the directory
    /// mismatches any verified claim. Unreported claims never mismatch.
    pub fn provider_mismatch(&self, directory_id: Option<u64>) -> bool {
        match self.provider {
            ProviderClaim::Verified(claimed) => directory_id != Some(claimed),
            ProviderClaim::Unreported => false,
        }
    }
}

/// User record as returned by the discovery query service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNodeUser {
    pub user_id: u64,
    pub wallet: String,
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub secondary1: Option<String>,
    #[serde(default)]
    pub secondary2: Option<String>,
    #[serde(default, rename = "primarySpID")]
    pub primary_sp_id: Option<u64>,
    #[serde(default, rename = "secondary1SpID")]
    pub secondary1_sp_id: Option<u64>,
    #[serde(default, rename = "secondary2SpID")]
    pub secondary2_sp_id: Option<u64>,
}

/// Role a node plays in a user's replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaRole {
    Primary,
    Secondary1,
    Secondary2,
}

/// A user's replica set as seen by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeUser {
    pub user_id: u64,
    pub wallet: String,
    pub primary: Option<ReplicaInfo>,
    pub secondary1: Option<ReplicaInfo>,
    pub secondary2: Option<ReplicaInfo>,
}

impl NodeUser {
    /// Convert a discovery record. Empty endpoints become empty slots. A
    /// populated slot without a provider ID is rejected unless legacy
    /// records are allowed.
    pub fn from_raw(raw: RawNodeUser, allow_legacy: bool) -> Result<Self> {
        let slot = |endpoint: Option<String>, sp_id: Option<u64>| -> Result<Option<ReplicaInfo>> {
            let endpoint = match endpoint {
                Some(e) if !e.is_empty() => e,
                _ => return Ok(None),
            };
            let provider = match sp_id {
                Some(id) => ProviderClaim::Verified(id),
                None if allow_legacy => ProviderClaim::Unreported,
                None => {
                    return Err(Error::DataInconsistency(format!(
                        "user {} replica {} has no provider ID",
                        raw.user_id, endpoint
                    )))
                }
            };
            Ok(Some(ReplicaInfo::new(endpoint, provider)))
        };

        Ok(Self {
            user_id: raw.user_id,
            primary: slot(raw.primary.clone(), raw.primary_sp_id)?,
            secondary1: slot(raw.secondary1.clone(), raw.secondary1_sp_id)?,
            secondary2: slot(raw.secondary2.clone(), raw.secondary2_sp_id)?,
            wallet: raw.wallet,
        })
    }

    pub fn primary_endpoint(&self) -> Option<&str> {
        self.primary.as_ref().map(|r| r.endpoint.as_str())
    }

    pub fn secondary1_endpoint(&self) -> Option<&str> {
        self.secondary1.as_ref().map(|r| r.endpoint.as_str())
    }

    pub fn secondary2_endpoint(&self) -> Option<&str> {
        self.secondary2.as_ref().map(|r| r.endpoint.as_str())
    }

    /// Populated slots, primary first
    pub fn replicas(&self) -> impl Iterator<Item = (ReplicaRole, &ReplicaInfo)> {
        [
            (ReplicaRole::Primary, self.primary.as_ref()),
            (ReplicaRole::Secondary1, self.secondary1.as_ref()),
            (ReplicaRole::Secondary2, self.secondary2.as_ref()),
        ]
        .into_iter()
        .filter_map(|(role, info)| info.map(|i| (role, i)))
    }

    pub fn role_of(&self, endpoint: &str) -> Option<ReplicaRole> {
        self.replicas()
            .find(|(_, info)| info.endpoint == endpoint)
            .map(|(role, _)| role)
    }
}

/// A sync the primary should ask a secondary to perform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRequest {
    pub wallet: String,
    pub primary: String,
    pub secondary: String,
    pub sync_type: SyncType,
    pub immediate: bool,
}

impl SyncRequest {
    pub fn recurring(wallet: &str, primary: &str, secondary: &str) -> Self {
        Self {
            wallet: wallet.to_string(),
            primary: primary.to_string(),
            secondary: secondary.to_string(),
            sync_type: SyncType::Recurring,
            immediate: false,
        }
    }
}

/// Replica set for a user with at least one unhealthy member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconfigOp {
    pub user_id: u64,
    pub wallet: String,
    pub primary: Option<String>,
    pub secondary1: Option<String>,
    pub secondary2: Option<String>,
    pub unhealthy_replicas: BTreeSet<String>,
}

impl ReconfigOp {
    pub fn for_user(user: &NodeUser, unhealthy_replicas: BTreeSet<String>) -> Self {
        Self {
            user_id: user.user_id,
            wallet: user.wallet.clone(),
            primary: user.primary_endpoint().map(str::to_string),
            secondary1: user.secondary1_endpoint().map(str::to_string),
            secondary2: user.secondary2_endpoint().map(str::to_string),
            unhealthy_replicas,
        }
    }

    pub fn is_unhealthy(&self, endpoint: Option<&str>) -> bool {
        endpoint.is_some_and(|e| self.unhealthy_replicas.contains(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(primary_sp: Option<u64>) -> RawNodeUser {
        RawNodeUser {
            user_id: 7,
            wallet: "0xabc".into(),
            primary: Some("http://cn1".into()),
            secondary1: Some("http://cn2".into()),
            secondary2: Some(String::new()),
            primary_sp_id: primary_sp,
            secondary1_sp_id: Some(2),
            secondary2_sp_id: None,
        }
    }

    #[test]
    fn test_mode_ordering_and_gating() {
        let highest = ReconfigMode::MultipleSecondaries;
        assert!(highest.enables(ReconfigMode::OneSecondary));
        assert!(highest.enables(ReconfigMode::MultipleSecondaries));
        assert!(!highest.enables(ReconfigMode::PrimaryAndOrSecondaries));
        assert!(!highest.enables(ReconfigMode::Disabled));

        for (enabled_rank, enabled) in ReconfigMode::ALL.into_iter().enumerate() {
            for (required_rank, required) in ReconfigMode::ALL.into_iter().enumerate() {
                let expected = enabled_rank > 0 && required_rank > 0 && required_rank <= enabled_rank;
                assert_eq!(enabled.enables(required), expected, "{} enabling {}", enabled, required);
            }
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "PRIMARY_AND_OR_SECONDARIES".parse::<ReconfigMode>().unwrap(),
            ReconfigMode::PrimaryAndOrSecondaries
        );
        assert!("primary".parse::<ReconfigMode>().is_err());
        assert_eq!(ReconfigMode::parse_or_disabled("bogus"), ReconfigMode::Disabled);
    }

    #[test]
    fn test_from_raw_legacy_and_empty_slots() {
        let user = NodeUser::from_raw(raw(None), true).unwrap();
        assert_eq!(user.primary.as_ref().unwrap().provider, ProviderClaim::Unreported);
        assert_eq!(user.secondary1.as_ref().unwrap().provider, ProviderClaim::Verified(2));
        assert!(user.secondary2.is_none());
        assert_eq!(user.role_of("http://cn2"), Some(ReplicaRole::Secondary1));

        assert!(NodeUser::from_raw(raw(None), false).is_err());
        assert!(NodeUser::from_raw(raw(Some(1)), false).is_ok());
    }

    #[test]
    fn test_provider_mismatch() {
        let verified = ReplicaInfo::new("http://cn1", ProviderClaim::Verified(1));
        assert!(!verified.provider_mismatch(Some(1)));
        assert!(verified.provider_mismatch(Some(3)));
        assert!(verified.provider_mismatch(None));

        let legacy = ReplicaInfo::new("http://cn1", ProviderClaim::Unreported);
        assert!(!legacy.provider_mismatch(Some(3)));
    }

    #[test]
    fn test_discovery_record_parsing() {
        let json = r#"{"user_id": 1, "wallet": "0x1", "primary": "http://cn1",
            "secondary1": "http://cn2", "secondary2": "http://cn3",
            "primarySpID": 1, "secondary1SpID": 2, "secondary2SpID": 3}"#;
        let raw: RawNodeUser = serde_json::from_str(json).unwrap();
        assert_eq!(raw.secondary2_sp_id, Some(3));

        let missing_wallet = r#"{"user_id": 1, "primary": "http://cn1"}"#;
        assert!(serde_json::from_str::<RawNodeUser>(missing_wallet).is_err());
    }
}
