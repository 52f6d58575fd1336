//! Snapback - Content Node Replica Reconciliation
//!
//! Runs the reconciliation engine for one content node and offers a few
//! operator commands against a running instance.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snapback::api::HttpServer;
use snapback::config::SnapbackConfig;
use snapback::node::Snapback;

/// Snapback - Content Node Replica Reconciliation
#[derive(Parser)]
#[command(name = "snapback")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "snapback.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the reconciliation engine
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "snapback.toml")]
        output: PathBuf,

        /// Public endpoint of this node
        #[arg(long, default_value = "https://cn1.example.com")]
        endpoint: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Query a running node's status
    Status {
        /// API address to query
        #[arg(short, long, default_value = "localhost:4300")]
        address: String,
    },

    /// Print the decision trail of a running node's last pass
    Trail {
        /// API address to query
        #[arg(short, long, default_value = "localhost:4300")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The config file may not exist yet for init, so fall back to defaults
    let (level, format) = match SnapbackConfig::from_file(&cli.config) {
        Ok(config) => (config.logging.level, config.logging.format),
        Err(_) => ("info".to_string(), "pretty".to_string()),
    };
    init_logging(cli.log_level.as_deref().unwrap_or(&level), &format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, endpoint } => run_init(output, endpoint),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Status { address } => run_get(address, "status").await,
        Commands::Trail { address } => run_get(address, "decision_trail").await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the reconciliation engine and the API server
async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    tracing::info!("Starting snapback...");

    let config = SnapbackConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    tracing::info!("Loaded configuration for node: {}", config.node.endpoint);

    std::fs::create_dir_all(config.state_dir())
        .with_context(|| format!("failed to create state directory {}", config.state_dir().display()))?;

    let api_config = config.api.clone();
    let node = Arc::new(Snapback::from_config(config).context("failed to build node")?);
    node.start().await?;

    let (api_shutdown_tx, api_shutdown_rx) = watch::channel(false);
    let server = HttpServer::new(api_config, Arc::clone(&node));
    let api_task = tokio::spawn(async move {
        if let Err(e) = server.start(api_shutdown_rx).await {
            tracing::error!("API server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    let _ = api_shutdown_tx.send(true);
    node.stop().await;
    if let Err(e) = api_task.await {
        tracing::warn!("API task ended abnormally: {}", e);
    }

    tracing::info!("Snapback shutdown complete");
    Ok(())
}

/// GET a JSON document from a running node and pretty-print it
async fn run_get(address: String, path: &str) -> anyhow::Result<()> {
    let url = format!("http://{}/{}", address, path);

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {}", url))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("invalid JSON response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        anyhow::bail!("{} returned {}", url, status);
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, endpoint: String) -> anyhow::Result<()> {
    let config_content = format!(
        r#"# Snapback Configuration
# Generated configuration file

[node]
endpoint = "{endpoint}"
# sp_id = 1
delegate_private_key = "changeme"
data_dir = "/var/lib/snapback"

[discovery]
endpoint = "https://discovery.example.com"
page_size = 10000
request_timeout_ms = 30000
allow_legacy_unreported_provider_ids = true

[authority]
endpoint = "https://authority.example.com"
request_timeout_ms = 30000

[health]
peer_health_check_timeout_ms = 2000
concurrency = 10
max_primary_unhealthy_secs = 86400

[reconfig]
# RECONFIG_DISABLED, ONE_SECONDARY, MULTIPLE_SECONDARIES,
# PRIMARY_AND_OR_SECONDARIES or ENTIRE_REPLICA_SET
highest_mode = "RECONFIG_DISABLED"
node_whitelist = []
min_failed_sync_requests_before_reconfig = 20
min_secondary_user_sync_success_percent = 50

[sync]
max_manual_concurrency = 15
max_recurring_concurrency = 5
manual_syncs_disabled = false
job_lock_duration_ms = 600000

[state_machine]
modulo_base = 48
job_interval_ms = 1800000

[api]
enabled = true
bind_address = "0.0.0.0:4300"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content).with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at your discovery service and assignment authority.");
    println!("Then start with: snapback start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match SnapbackConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Endpoint: {}", config.node.endpoint);
            println!("  Discovery: {}", config.discovery.endpoint);
            println!("  Authority: {}", config.authority.endpoint);
            println!("  Highest reconfig mode: {}", config.highest_reconfig_mode());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = SnapbackConfig::from_file(&config_path)?;

    println!("Snapback Node Information");
    println!("=========================");
    println!();
    println!("Endpoint:         {}", config.node.endpoint);
    match config.node.sp_id {
        Some(sp_id) => println!("SP ID:            {}", sp_id),
        None => println!("SP ID:            (unregistered)"),
    }
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!();
    println!("Reconfiguration:");
    println!("  Highest Mode:   {}", config.highest_reconfig_mode());
    println!("  Whitelist:      {:?}", config.reconfig.node_whitelist);
    println!();
    println!("Sync Queues:");
    println!("  Manual:         {} workers", config.sync.max_manual_concurrency);
    println!("  Recurring:      {} workers", config.sync.max_recurring_concurrency);
    println!("  Manual Syncs:   {}", if config.sync.manual_syncs_disabled { "disabled" } else { "enabled" });
    println!();
    println!("State Machine:");
    println!("  Modulo Base:    {}", config.state_machine.modulo_base);
    println!("  Interval:       {:?}", config.job_interval());
    println!("  Lock Duration:  {:?}", config.lock_duration());

    Ok(())
}
