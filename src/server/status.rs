// src/server/status.rs

//! The status dashboard: a single `GET /status` JSON endpoint reporting
//! process uptime and per-target replication health.

use crate::config::WebUiConfig;
use crate::coordinator::state::TargetState;
use anyhow::Result;
use axum::extract::State;
use axum::{routing::get, Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Clone)]
struct AppState {
    targets: Arc<DashMap<String, TargetState>>,
    started_at: Instant,
}

#[derive(Serialize)]
struct TargetStatus {
    phase: String,
    healthy: bool,
    total_synced: u64,
    total_failed: u64,
    last_sync_time: Option<String>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    uptime_s: u64,
    targets: HashMap<String, TargetStatus>,
}

/// Serves `GET /status` until `shutdown_rx` fires, matching the teacher's
/// `metrics_server.rs` shape (there: Prometheus text on `/metrics`; here:
/// JSON on `/status`).
pub async fn run_status_server(
    config: WebUiConfig,
    targets: Arc<DashMap<String, TargetState>>,
    started_at: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let state = AppState {
        targets,
        started_at,
    };
    let app = Router::new()
        .route("/status", get(status_handler))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let targets = state
        .targets
        .iter()
        .map(|entry| {
            let name = entry.key().clone();
            let s = entry.value();
            let status = TargetStatus {
                phase: format!("{:?}", s.phase).to_uppercase(),
                healthy: s.is_healthy(),
                total_synced: s.total_synced,
                total_failed: s.total_failed,
                last_sync_time: s.last_sync_wall_time.map(|t| {
                    chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()
                }),
                last_error: s.last_error.clone(),
                consecutive_failures: s.consecutive_failures,
            };
            (name, status)
        })
        .collect();

    Json(StatusResponse {
        running: true,
        uptime_s: state.started_at.elapsed().as_secs(),
        targets,
    })
}
