//! Snapback Configuration
//!
//! Configuration structures for the reconciliation engine. Every tunable
//! threshold carries a default so a minimal file only names the node and
//! its collaborators.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::ReconfigMode;

/// Main Snapback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapbackConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Discovery query service
    pub discovery: DiscoveryConfig,

    /// Assignment authority (replica-set registry gateway)
    pub authority: AuthorityConfig,

    /// Peer health thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Replica-set reconfiguration
    #[serde(default)]
    pub reconfig: ReconfigConfig,

    /// Sync request pipeline
    #[serde(default)]
    pub sync: SyncConfig,

    /// Periodic reconciliation pass
    #[serde(default)]
    pub state_machine: StateMachineConfig,

    /// Introspection API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Public endpoint of this content node
    pub endpoint: String,

    /// Service provider ID registered for this node
    #[serde(default)]
    pub sp_id: Option<u64>,

    /// Secret used to sign peer requests
    #[serde(default)]
    pub delegate_private_key: String,

    /// Data directory for persisted sync history
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Discovery query service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Base URL of the discovery node
    pub endpoint: String,

    /// Users fetched per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Request timeout in milliseconds
    #[serde(default = "default_discovery_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Accept users whose replicas carry no provider ID
    #[serde(default = "default_true")]
    pub allow_legacy_unreported_provider_ids: bool,
}

/// Assignment authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Base URL of the registry gateway
    pub endpoint: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_authority_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Peer health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_peer_health_check_timeout_ms")]
    pub peer_health_check_timeout_ms: u64,

    /// Peers health-checked in parallel
    #[serde(default = "default_parallelism")]
    pub concurrency: usize,

    /// Minimum free storage in bytes
    #[serde(default = "default_minimum_storage_path_size")]
    pub minimum_storage_path_size: u64,

    /// Minimum free memory in bytes
    #[serde(default = "default_minimum_memory_available")]
    pub minimum_memory_available: u64,

    #[serde(default = "default_max_file_descriptors_allocated_percentage")]
    pub max_file_descriptors_allocated_percentage: u64,

    #[serde(default = "default_minimum_daily_sync_count")]
    pub minimum_daily_sync_count: u64,

    #[serde(default = "default_minimum_rolling_sync_count")]
    pub minimum_rolling_sync_count: u64,

    #[serde(default)]
    pub minimum_successful_sync_count_percentage: u64,

    /// Grace period before an unhealthy primary is replaced
    #[serde(default = "default_max_primary_unhealthy_secs")]
    pub max_primary_unhealthy_secs: u64,
}

/// Replica-set reconfiguration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigConfig {
    /// Highest reconfig mode this node may execute
    #[serde(default = "default_highest_mode")]
    pub highest_mode: String,

    /// Restrict replacement candidates to these endpoints (empty = any)
    #[serde(default)]
    pub node_whitelist: Vec<String>,

    #[serde(default = "default_max_select_attempts")]
    pub max_select_attempts: u32,

    #[serde(default = "default_min_failed_sync_requests_before_reconfig")]
    pub min_failed_sync_requests_before_reconfig: u64,

    #[serde(default = "default_min_secondary_user_sync_success_percent")]
    pub min_secondary_user_sync_success_percent: u64,

    /// Timeout for single-wallet clock queries against candidates
    #[serde(default = "default_clock_status_timeout_ms")]
    pub clock_status_timeout_ms: u64,
}

/// Sync request pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_max_manual_concurrency")]
    pub max_manual_concurrency: usize,

    #[serde(default = "default_max_recurring_concurrency")]
    pub max_recurring_concurrency: usize,

    #[serde(default = "default_monitoring_retry_delay_ms")]
    pub monitoring_retry_delay_ms: u64,

    #[serde(default = "default_max_monitoring_duration_ms")]
    pub max_monitoring_duration_ms: u64,

    /// A sync job running longer than this is reported as stalled
    #[serde(default = "default_job_lock_duration_ms")]
    pub job_lock_duration_ms: u64,

    /// Stop syncing a (secondary, wallet) once today's failures exceed this
    #[serde(default = "default_daily_failure_count_threshold")]
    pub daily_failure_count_threshold: u64,

    #[serde(default)]
    pub manual_syncs_disabled: bool,

    #[serde(default = "default_sync_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_batch_clock_status_batch_size")]
    pub batch_clock_status_batch_size: usize,

    #[serde(default = "default_batch_clock_status_timeout_ms")]
    pub batch_clock_status_timeout_ms: u64,

    #[serde(default = "default_max_batch_clock_fetch_retries")]
    pub max_batch_clock_fetch_retries: u32,

    /// Replicas queried for clocks in parallel
    #[serde(default = "default_parallelism")]
    pub clock_fetch_concurrency: usize,
}

/// Periodic reconciliation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineConfig {
    #[serde(default = "default_modulo_base")]
    pub modulo_base: u64,

    #[serde(default = "default_job_interval_ms")]
    pub job_interval_ms: u64,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_aggregate_batch_size")]
    pub aggregate_batch_size: usize,

    #[serde(default = "default_parallelism")]
    pub aggregate_concurrency: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapback")
}

fn default_page_size() -> usize {
    10_000
}

fn default_discovery_timeout_ms() -> u64 {
    30_000
}

fn default_authority_timeout_ms() -> u64 {
    30_000
}

fn default_peer_health_check_timeout_ms() -> u64 {
    2_000
}

fn default_parallelism() -> usize {
    10
}

fn default_minimum_storage_path_size() -> u64 {
    100_000_000_000
}

fn default_minimum_memory_available() -> u64 {
    2_000_000_000
}

fn default_max_file_descriptors_allocated_percentage() -> u64 {
    95
}

fn default_minimum_daily_sync_count() -> u64 {
    50
}

fn default_minimum_rolling_sync_count() -> u64 {
    5_000
}

fn default_max_primary_unhealthy_secs() -> u64 {
    86_400
}

fn default_highest_mode() -> String {
    ReconfigMode::Disabled.to_string()
}

fn default_max_select_attempts() -> u32 {
    100
}

fn default_min_failed_sync_requests_before_reconfig() -> u64 {
    20
}

fn default_min_secondary_user_sync_success_percent() -> u64 {
    50
}

fn default_clock_status_timeout_ms() -> u64 {
    2_000
}

fn default_max_manual_concurrency() -> usize {
    15
}

fn default_max_recurring_concurrency() -> usize {
    5
}

fn default_monitoring_retry_delay_ms() -> u64 {
    15_000
}

fn default_max_monitoring_duration_ms() -> u64 {
    300_000
}

fn default_job_lock_duration_ms() -> u64 {
    default_max_monitoring_duration_ms() * 2
}

fn default_daily_failure_count_threshold() -> u64 {
    20
}

fn default_sync_request_timeout_ms() -> u64 {
    10_000
}

fn default_batch_clock_status_batch_size() -> usize {
    5_000
}

fn default_batch_clock_status_timeout_ms() -> u64 {
    10_000
}

fn default_max_batch_clock_fetch_retries() -> u32 {
    5
}

fn default_modulo_base() -> u64 {
    48
}

fn default_job_interval_ms() -> u64 {
    1_800_000
}

fn default_initial_delay_ms() -> u64 {
    30_000
}

fn default_aggregate_batch_size() -> usize {
    500
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:4300".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            peer_health_check_timeout_ms: default_peer_health_check_timeout_ms(),
            concurrency: default_parallelism(),
            minimum_storage_path_size: default_minimum_storage_path_size(),
            minimum_memory_available: default_minimum_memory_available(),
            max_file_descriptors_allocated_percentage: default_max_file_descriptors_allocated_percentage(),
            minimum_daily_sync_count: default_minimum_daily_sync_count(),
            minimum_rolling_sync_count: default_minimum_rolling_sync_count(),
            minimum_successful_sync_count_percentage: 0,
            max_primary_unhealthy_secs: default_max_primary_unhealthy_secs(),
        }
    }
}

impl Default for ReconfigConfig {
    fn default() -> Self {
        Self {
            highest_mode: default_highest_mode(),
            node_whitelist: Vec::new(),
            max_select_attempts: default_max_select_attempts(),
            min_failed_sync_requests_before_reconfig: default_min_failed_sync_requests_before_reconfig(),
            min_secondary_user_sync_success_percent: default_min_secondary_user_sync_success_percent(),
            clock_status_timeout_ms: default_clock_status_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_manual_concurrency: default_max_manual_concurrency(),
            max_recurring_concurrency: default_max_recurring_concurrency(),
            monitoring_retry_delay_ms: default_monitoring_retry_delay_ms(),
            max_monitoring_duration_ms: default_max_monitoring_duration_ms(),
            job_lock_duration_ms: default_job_lock_duration_ms(),
            daily_failure_count_threshold: default_daily_failure_count_threshold(),
            manual_syncs_disabled: false,
            request_timeout_ms: default_sync_request_timeout_ms(),
            batch_clock_status_batch_size: default_batch_clock_status_batch_size(),
            batch_clock_status_timeout_ms: default_batch_clock_status_timeout_ms(),
            max_batch_clock_fetch_retries: default_max_batch_clock_fetch_retries(),
            clock_fetch_concurrency: default_parallelism(),
        }
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            modulo_base: default_modulo_base(),
            job_interval_ms: default_job_interval_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            aggregate_batch_size: default_aggregate_batch_size(),
            aggregate_concurrency: default_parallelism(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SnapbackConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SnapbackConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.endpoint.is_empty() {
            return Err(crate::Error::Config("node.endpoint cannot be empty".into()));
        }

        if self.discovery.endpoint.is_empty() {
            return Err(crate::Error::Config("discovery.endpoint cannot be empty".into()));
        }

        if self.authority.endpoint.is_empty() {
            return Err(crate::Error::Config("authority.endpoint cannot be empty".into()));
        }

        if self.state_machine.modulo_base == 0 {
            return Err(crate::Error::Config("state_machine.modulo_base must be positive".into()));
        }

        if self.state_machine.job_interval_ms == 0 {
            return Err(crate::Error::Config("state_machine.job_interval_ms must be positive".into()));
        }

        if self.sync.job_lock_duration_ms == 0 {
            return Err(crate::Error::Config("sync.job_lock_duration_ms must be positive".into()));
        }

        if self.sync.max_manual_concurrency == 0 || self.sync.max_recurring_concurrency == 0 {
            return Err(crate::Error::Config("sync queue concurrency must be positive".into()));
        }

        if self.sync.batch_clock_status_batch_size == 0 || self.discovery.page_size == 0 {
            return Err(crate::Error::Config("batch and page sizes must be positive".into()));
        }

        let percentages = [
            ("health.max_file_descriptors_allocated_percentage", self.health.max_file_descriptors_allocated_percentage),
            ("health.minimum_successful_sync_count_percentage", self.health.minimum_successful_sync_count_percentage),
            ("reconfig.min_secondary_user_sync_success_percent", self.reconfig.min_secondary_user_sync_success_percent),
        ];
        for (name, value) in percentages {
            if value > 100 {
                return Err(crate::Error::Config(format!("{} must be at most 100", name)));
            }
        }

        Ok(())
    }

    /// Highest enabled reconfig mode; unrecognized values disable reconfig
    pub fn highest_reconfig_mode(&self) -> ReconfigMode {
        ReconfigMode::parse_or_disabled(&self.reconfig.highest_mode)
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get the state-machine interval as Duration
    pub fn job_interval(&self) -> Duration {
        Duration::from_millis(self.state_machine.job_interval_ms)
    }

    /// A pass running longer than this is reported as stalled
    pub fn lock_duration(&self) -> Duration {
        self.job_interval() * 2
    }

    /// Get the delay before the first pass
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.state_machine.initial_delay_ms)
    }

    /// Get the primary grace period as Duration
    pub fn max_primary_unhealthy(&self) -> Duration {
        Duration::from_secs(self.health.max_primary_unhealthy_secs)
    }

    pub fn monitoring_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sync.monitoring_retry_delay_ms)
    }

    pub fn max_monitoring_duration(&self) -> Duration {
        Duration::from_millis(self.sync.max_monitoring_duration_ms)
    }

    pub fn job_lock_duration(&self) -> Duration {
        Duration::from_millis(self.sync.job_lock_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[node]
endpoint = "https://cn1.example.com"
sp_id = 1

[discovery]
endpoint = "https://dn1.example.com"

[authority]
endpoint = "https://registry.example.com"
"#;

    #[test]
    fn test_parse_config() {
        let config = SnapbackConfig::from_str(MINIMAL).unwrap();
        assert_eq!(config.node.endpoint, "https://cn1.example.com");
        assert_eq!(config.node.sp_id, Some(1));
        assert_eq!(config.state_machine.modulo_base, 48);
        assert_eq!(config.sync.max_manual_concurrency, 15);
        assert_eq!(config.sync.max_recurring_concurrency, 5);
        assert_eq!(config.health.minimum_storage_path_size, 100_000_000_000);
        assert_eq!(config.lock_duration(), Duration::from_millis(3_600_000));
        assert_eq!(config.highest_reconfig_mode(), ReconfigMode::Disabled);
    }

    #[test]
    fn test_invalid_mode_disables_reconfig() {
        let toml = format!("{}\n[reconfig]\nhighest_mode = \"EVERYTHING\"\n", MINIMAL);
        let config = SnapbackConfig::from_str(&toml).unwrap();
        assert_eq!(config.highest_reconfig_mode(), ReconfigMode::Disabled);

        let toml = format!("{}\n[reconfig]\nhighest_mode = \"ONE_SECONDARY\"\n", MINIMAL);
        let config = SnapbackConfig::from_str(&toml).unwrap();
        assert_eq!(config.highest_reconfig_mode(), ReconfigMode::OneSecondary);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let toml = format!("{}\n[state_machine]\nmodulo_base = 0\n", MINIMAL);
        assert!(SnapbackConfig::from_str(&toml).is_err());

        let toml = format!("{}\n[health]\nmax_file_descriptors_allocated_percentage = 120\n", MINIMAL);
        assert!(SnapbackConfig::from_str(&toml).is_err());

        let toml = MINIMAL.replace("https://cn1.example.com", "");
        assert!(SnapbackConfig::from_str(&toml).is_err());

        let toml = format!("{}\n[state_machine]\njob_interval_ms = 0\n", MINIMAL);
        assert!(SnapbackConfig::from_str(&toml).is_err());

        let toml = format!("{}\n[sync]\njob_lock_duration_ms = 0\n", MINIMAL);
        assert!(SnapbackConfig::from_str(&toml).is_err());
    }
}
