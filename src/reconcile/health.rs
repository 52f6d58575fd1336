//! Peer Health Evaluation
//!
//! Classifies peers as healthy or unhealthy from their verbose health
//! report and applies the grace period before a primary is given up on.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;

use crate::config::HealthConfig;
use crate::model::NodeUser;
use crate::peer::{PeerClient, VerboseHealth};
use crate::state::{NodeHealthStore, PrimaryHealth};

/// Thresholds applied to verbose health reports
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub minimum_storage_path_size: u64,
    pub minimum_memory_available: u64,
    pub max_file_descriptors_allocated_percentage: u64,
    pub minimum_daily_sync_count: u64,
    pub minimum_rolling_sync_count: u64,
    pub minimum_successful_sync_count_percentage: u64,
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            minimum_storage_path_size: config.minimum_storage_path_size,
            minimum_memory_available: config.minimum_memory_available,
            max_file_descriptors_allocated_percentage: config.max_file_descriptors_allocated_percentage,
            minimum_daily_sync_count: config.minimum_daily_sync_count,
            minimum_rolling_sync_count: config.minimum_rolling_sync_count,
            minimum_successful_sync_count_percentage: config.minimum_successful_sync_count_percentage,
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

/// A threshold a peer breached
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HealthViolation {
    LowStorage { available: u64, minimum: u64 },
    LowMemory { available: u64, minimum: u64 },
    FileDescriptors { allocated: u64, max: u64, max_percentage: u64 },
    DailySyncSuccessRate { success: u64, failure: u64, minimum_percentage: u64 },
    RollingSyncSuccessRate { success: u64, failure: u64, minimum_percentage: u64 },
}

impl std::fmt::Display for HealthViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthViolation::LowStorage { available, minimum } => {
                write!(f, "storage available {} <= minimum {}", available, minimum)
            }
            HealthViolation::LowMemory { available, minimum } => {
                write!(f, "memory available {} <= minimum {}", available, minimum)
            }
            HealthViolation::FileDescriptors { allocated, max, max_percentage } => {
                write!(f, "file descriptors {}/{} >= {}%", allocated, max, max_percentage)
            }
            HealthViolation::DailySyncSuccessRate { success, failure, minimum_percentage } => {
                write!(f, "daily sync success {}/{} below {}%", success, success + failure, minimum_percentage)
            }
            HealthViolation::RollingSyncSuccessRate { success, failure, minimum_percentage } => {
                write!(f, "rolling sync success {}/{} below {}%", success, success + failure, minimum_percentage)
            }
        }
    }
}

fn present(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}

fn sync_rate_breached(success: Option<u64>, failure: Option<u64>, minimum_count: u64, minimum_percentage: u64) -> Option<(u64, u64)> {
    let (success, failure) = (success?, failure?);
    let total = success + failure;
    if total > minimum_count && (success as f64 / total as f64) < (minimum_percentage as f64 / 100.0) {
        Some((success, failure))
    } else {
        None
    }
}

/// Every threshold the report breaches. A check only runs when all of
/// its input fields are reported.
pub fn evaluate_verbose_health(health: &VerboseHealth, thresholds: &HealthThresholds) -> Vec<HealthViolation> {
    let mut violations = Vec::new();

    if let (Some(size), Some(used)) = (present(health.storage_path_size), present(health.storage_path_used)) {
        let available = size.saturating_sub(used);
        if available <= thresholds.minimum_storage_path_size {
            violations.push(HealthViolation::LowStorage {
                available,
                minimum: thresholds.minimum_storage_path_size,
            });
        }
    }

    if let (Some(total), Some(used)) = (present(health.total_memory), present(health.used_memory)) {
        let available = total.saturating_sub(used);
        if available <= thresholds.minimum_memory_available {
            violations.push(HealthViolation::LowMemory {
                available,
                minimum: thresholds.minimum_memory_available,
            });
        }
    }

    if let (Some(allocated), Some(max)) = (
        present(health.allocated_file_descriptors),
        present(health.max_file_descriptors),
    ) {
        let ratio = allocated as f64 / max as f64;
        if ratio >= thresholds.max_file_descriptors_allocated_percentage as f64 / 100.0 {
            violations.push(HealthViolation::FileDescriptors {
                allocated,
                max,
                max_percentage: thresholds.max_file_descriptors_allocated_percentage,
            });
        }
    }

    if let Some((success, failure)) = sync_rate_breached(
        health.daily_sync_success_count,
        health.daily_sync_fail_count,
        thresholds.minimum_daily_sync_count,
        thresholds.minimum_successful_sync_count_percentage,
    ) {
        violations.push(HealthViolation::DailySyncSuccessRate {
            success,
            failure,
            minimum_percentage: thresholds.minimum_successful_sync_count_percentage,
        });
    }

    if let Some((success, failure)) = sync_rate_breached(
        health.thirty_day_rolling_sync_success_count,
        health.thirty_day_rolling_sync_fail_count,
        thresholds.minimum_rolling_sync_count,
        thresholds.minimum_successful_sync_count_percentage,
    ) {
        violations.push(HealthViolation::RollingSyncSuccessRate {
            success,
            failure,
            minimum_percentage: thresholds.minimum_successful_sync_count_percentage,
        });
    }

    violations
}

/// Union of replica endpoints across users, excluding self and empty slots
pub fn compute_peer_set(users: &[NodeUser], self_endpoint: &str) -> BTreeSet<String> {
    users
        .iter()
        .flat_map(|user| user.replicas().map(|(_, info)| info.endpoint.clone()))
        .filter(|endpoint| endpoint != self_endpoint)
        .collect()
}

/// Grace-period aware primary check
#[async_trait]
pub trait PrimaryHealthCheck: Send + Sync {
    /// False only once the primary has failed continuously for the
    /// grace period
    async fn is_primary_healthy(&self, endpoint: &str) -> bool;
}

/// Health-checks peers over the wire
pub struct PeerHealthEvaluator {
    client: Arc<dyn PeerClient>,
    node_health: Arc<NodeHealthStore>,
    thresholds: HealthThresholds,
    self_endpoint: String,
    concurrency: usize,
}

impl PeerHealthEvaluator {
    pub fn new(
        client: Arc<dyn PeerClient>,
        node_health: Arc<NodeHealthStore>,
        thresholds: HealthThresholds,
        self_endpoint: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            node_health,
            thresholds,
            self_endpoint: self_endpoint.into(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn self_endpoint(&self) -> &str {
        &self.self_endpoint
    }

    /// Health-check one peer. A simple check only requires the route to
    /// answer successfully.
    pub async fn is_healthy(&self, endpoint: &str, simple: bool) -> bool {
        let health = match self.client.verbose_health(endpoint).await {
            Ok(health) => health,
            Err(e) => {
                tracing::warn!("Health check for {} failed: {}", endpoint, e);
                return false;
            }
        };

        if simple {
            return true;
        }

        let violations = evaluate_verbose_health(&health, &self.thresholds);
        for violation in &violations {
            tracing::warn!("Peer {} unhealthy: {}", endpoint, violation);
        }
        violations.is_empty()
    }

    /// Peers across `users` that fail a health check
    pub async fn unhealthy_peers(&self, users: &[NodeUser], simple: bool) -> BTreeSet<String> {
        let peers = compute_peer_set(users, &self.self_endpoint);
        self.check_all(peers.into_iter().collect(), simple)
            .await
            .into_iter()
            .filter_map(|(endpoint, healthy)| (!healthy).then_some(endpoint))
            .collect()
    }

    /// Candidates that pass a full health check, in input order
    pub async fn healthy_subset(&self, candidates: Vec<String>) -> Vec<String> {
        let results = self.check_all(candidates.clone(), false).await;
        candidates
            .into_iter()
            .filter(|c| results.iter().any(|(endpoint, healthy)| *healthy && endpoint == c))
            .collect()
    }

    async fn check_all(&self, endpoints: Vec<String>, simple: bool) -> Vec<(String, bool)> {
        stream::iter(endpoints)
            .map(|endpoint| {
                async move {
                    let healthy = self.is_healthy(&endpoint, simple).await;
                    (endpoint, healthy)
                }
                .boxed()
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

#[async_trait]
impl PrimaryHealthCheck for PeerHealthEvaluator {
    async fn is_primary_healthy(&self, endpoint: &str) -> bool {
        let passed = self.is_healthy(endpoint, true).await;
        let state = self.node_health.observe_primary(endpoint, passed, Utc::now());
        if state == PrimaryHealth::ProvisionallyUnhealthy {
            tracing::info!(
                "Primary {} failing since {:?}, within grace period of {:?}",
                endpoint,
                self.node_health.first_failure(endpoint),
                self.node_health.grace_period()
            );
        }
        state.is_healthy()
    }
}
