//! HTTP route handlers.
//!
//! All handlers are thin — they delegate to the audio core for anything
//! that isn't pure request/response plumbing.

use std::sync::Arc;

use async_stream::stream;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::AppState;
use crate::error::TowerError;
use crate::fallback::FallbackProvider;
use crate::protocol_constants::SERVICE_ID;

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/tower/buffer", get(buffer_stats))
        .route("/control/source", post(set_source))
        .route("/stream", get(stream_audio))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe: "is the process running?". Always 200 if it answers.
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": SERVICE_ID }))
}

#[derive(Serialize)]
struct StatusResponse {
    service: &'static str,
    mode: crate::manager::OperationalMode,
    listener_count: usize,
    uptime_secs: u64,
    encoder_running: bool,
    source_mode: Option<&'static str>,
}

/// Operational snapshot for dashboards and monitoring: current routing mode,
/// connected listener count, process uptime, whether the encoder subprocess
/// is up, and (only while actually on air) which fallback tier is playing.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        service: SERVICE_ID,
        mode: state.tower.manager.mode(),
        listener_count: state.tower.fanout.listener_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        encoder_running: state.tower.manager.encoder_running(),
        source_mode: state.tower.manager.source_mode(),
    })
}

#[derive(Serialize)]
struct BufferResponse {
    capacity: usize,
    count: usize,
    overflow_count: u64,
    ratio: f64,
}

/// PCM ingest ring occupancy, for diagnosing upstream-feed stalls.
async fn buffer_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.tower.pcm_ring.stats();
    Json(BufferResponse {
        capacity: stats.capacity,
        count: stats.count,
        overflow_count: stats.overflow_count,
        ratio: stats.ratio(),
    })
}

#[derive(Deserialize)]
struct SourceRequest {
    source: String,
}

/// Operator-driven source override (`POST /control/source`). Degrades the
/// fallback tier by name; never restores a higher tier once requested.
async fn set_source(
    State(state): State<AppState>,
    Json(body): Json<SourceRequest>,
) -> Result<impl IntoResponse, TowerError> {
    let tier = FallbackProvider::tier_from_name(&body.source)
        .ok_or_else(|| TowerError::InvalidSourceSelection(body.source.clone()))?;
    let in_effect = state.tower.fallback.request_tier(tier);
    Ok(Json(json!({ "requested": body.source, "tier_in_effect": in_effect })))
}

/// Live MP3 stream. Registers a new listener with the fanout, wraps its
/// channel in a generator that forwards frames to the response body and
/// reports delivered bytes back so the fanout can detect a stalled client,
/// and unregisters on drop (client disconnect or body error).
async fn stream_audio(State(state): State<AppState>) -> Response {
    let mut listener = state.tower.fanout.register();
    let id = listener.id;
    let fanout = Arc::clone(&state.tower.fanout);

    let body_stream = stream! {
        while let Some(frame) = listener.receiver.recv().await {
            let len = frame.len();
            yield Ok::<Bytes, std::io::Error>(frame);
            listener.acknowledge(len);
        }
        fanout.unregister(id);
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
