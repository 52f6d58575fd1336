//! HTTP API Server
//!
//! Read-only introspection of the reconciliation engine plus a manual
//! sync trigger.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::model::{SyncRequest, SyncType};
use crate::node::{PassSummary, Snapback};
use crate::reconcile::TrailEntry;
use crate::state::SyncMetrics;
use crate::sync::{QueueDepth, SyncJobHandle, SyncQueueJobs};

/// Shared application state
pub struct AppState {
    pub node: Arc<Snapback>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, node: Arc<Snapback>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { node }),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/queues", get(handle_queues))
            .route("/decision_trail", get(handle_decision_trail))
            .route("/history/:secondary", get(handle_history))
            .route("/manual_sync", post(handle_manual_sync))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` flips
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub endpoint: String,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub endpoint: String,
    pub sp_id: Option<u64>,
    pub highest_reconfig_mode: String,
    pub current_modulo_slice: u64,
    pub modulo_base: u64,
    pub uptime_seconds: i64,
    pub passes_completed: u64,
    pub directory_size: usize,
    pub last_pass: Option<serde_json::Value>,
}

/// Queue response
#[derive(Debug, Serialize)]
pub struct QueuesResponse {
    pub depths: Vec<QueueDepth>,
    pub jobs: SyncQueueJobs,
    pub pending_keys: usize,
}

/// One row of a secondary's sync history
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub wallet: String,
    pub sync_type: SyncType,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
}

/// Manual sync request
#[derive(Debug, Serialize, Deserialize)]
pub struct ManualSyncRequest {
    pub wallet: String,
    pub secondary: String,
    #[serde(default = "default_immediate")]
    pub immediate: bool,
}

fn default_immediate() -> bool {
    true
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, error: impl Into<String>, code: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        endpoint: state.node.config().node.endpoint.clone(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let node = &state.node;
    let config = node.config();
    let last_pass = node
        .last_pass()
        .await
        .and_then(|summary: PassSummary| serde_json::to_value(summary).ok());

    Json(StatusResponse {
        endpoint: config.node.endpoint.clone(),
        sp_id: config.node.sp_id,
        highest_reconfig_mode: config.highest_reconfig_mode().to_string(),
        current_modulo_slice: node.orchestrator().current_slice(),
        modulo_base: node.orchestrator().modulo_base(),
        uptime_seconds: (Utc::now() - node.started_at()).num_seconds(),
        passes_completed: node.passes_completed(),
        directory_size: node.directory_size().await,
        last_pass,
    })
}

async fn handle_queues(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(QueuesResponse {
        depths: state.node.queue_depths(),
        jobs: state.node.queue_jobs(),
        pending_keys: state.node.scheduler().pending_keys(),
    })
}

async fn handle_decision_trail(State(state): State<Arc<AppState>>) -> Response {
    match state.node.last_trail().await {
        Some(trail) => Json::<Vec<TrailEntry>>(trail.entries().to_vec()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No reconciliation pass has run yet", "NO_TRAIL"),
    }
}

async fn handle_history(State(state): State<Arc<AppState>>, Path(secondary): Path<String>) -> Response {
    match state.node.history().secondary_metrics_today(&secondary).await {
        Ok(rows) => {
            let entries: Vec<HistoryEntry> = rows
                .into_iter()
                .map(|(wallet, sync_type, metrics): (String, SyncType, SyncMetrics)| HistoryEntry {
                    wallet,
                    sync_type,
                    success_count: metrics.success_count,
                    failure_count: metrics.failure_count,
                    success_rate: metrics.success_rate(),
                })
                .collect();
            Json(entries).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "HISTORY_ERROR"),
    }
}

async fn handle_manual_sync(State(state): State<Arc<AppState>>, Json(req): Json<ManualSyncRequest>) -> Response {
    let self_endpoint = state.node.config().node.endpoint.clone();
    let request = SyncRequest {
        sync_type: SyncType::Manual,
        immediate: req.immediate,
        ..SyncRequest::recurring(&req.wallet, &self_endpoint, &req.secondary)
    };

    match state.node.scheduler().enqueue_sync(request) {
        Ok(handle) => Json::<SyncJobHandle>(handle).into_response(),
        Err(Error::ManualSyncsDisabled) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Manual syncs are disabled on this node",
            "MANUAL_SYNCS_DISABLED",
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "ENQUEUE_FAILED"),
    }
}
