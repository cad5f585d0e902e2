//! HTTP status endpoint — exposes relay state as JSON.

use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use camrelay_services::stats::RelayStatsHandle;
use camrelay_services::{ConsumerInfo, Multiplexer, RelayStatsSnapshot};

#[derive(Clone)]
pub struct StatusState {
    pub mux:     Multiplexer,
    pub stats:   RelayStatsHandle,
    pub started: Instant,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs:  u64,
    pub viewers:      usize,
    pub max_viewers:  usize,
    pub latest_frame: Option<LatestFrame>,
    pub relay:        RelayStatsSnapshot,
}

#[derive(Serialize)]
pub struct LatestFrame {
    pub seq:   u32,
    pub bytes: usize,
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    let latest_frame = state.mux.latest().map(|f| LatestFrame {
        seq:   f.seq(),
        bytes: f.len(),
    });

    Json(StatusResponse {
        uptime_secs: state.started.elapsed().as_secs(),
        viewers:     state.mux.consumer_count(),
        max_viewers: state.mux.max_consumers(),
        latest_frame,
        relay:       state.stats.snapshot(),
    })
}

// ── /viewers ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ViewersResponse {
    pub viewers: Vec<ConsumerInfo>,
}

async fn handle_viewers(State(state): State<StatusState>) -> Json<ViewersResponse> {
    Json(ViewersResponse {
        viewers: state.mux.consumers(),
    })
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status",  get(handle_status))
        .route("/viewers", get(handle_viewers))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(
    state: StatusState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
