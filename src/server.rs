/*
 * Meeting Companion Server - HTTP/WebSocket Server
 * Copyright (c) 2024 Meeting Companion Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use crate::service::{RealtimeService, RoiInput};
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RealtimeService>,
}

pub fn build_router(service: Arc<RealtimeService>) -> Router {
    let upload_dir = service.config.upload_dir.clone();
    let state = AppState { service };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions/:session_id/snapshot", get(session_snapshot))
        .route("/sessions/:session_id/roi", put(upsert_roi))
        .route("/sessions/:session_id/flush", post(flush_session))
        .route("/sessions/:session_id/captures", get(list_captures))
        .route("/sessions/:session_id/windows", get(list_windows))
        .route("/ws/audio/:session_id", get(ws::audio_handler))
        .route("/ws/in-meeting/:session_id", get(ws::ingest_handler))
        .route("/ws/frontend/:session_id", get(ws::frontend_handler))
        .route("/ws/realtime-av/:session_id", get(ws::realtime_av_handler))
        .nest_service("/files", ServeDir::new(upload_dir))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn session_snapshot(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.service.get_snapshot(&session_id) {
        Some(snapshot) => (StatusCode::OK, Json(serde_json::json!(snapshot))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown session" })),
        ),
    }
}

async fn upsert_roi(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(roi): Json<RoiInput>,
) -> impl IntoResponse {
    let roi = roi.to_roi();
    match state.service.set_roi(&session_id, roi).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "session_id": session_id, "roi": roi })),
        ),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": err.to_string() })),
        ),
    }
}

async fn flush_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.service.flush_session(&session_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "session_id": session_id, "flushed": true })),
        ),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": err.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_captures(
    Path(session_id): Path<String>,
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let captures = state
        .service
        .storage()
        .list_captures(&session_id, query.limit)
        .await;
    Json(serde_json::json!({ "total": captures.len(), "captures": captures }))
}

async fn list_windows(
    Path(session_id): Path<String>,
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let windows = state
        .service
        .storage()
        .list_windows(&session_id, query.limit)
        .await;
    Json(serde_json::json!({ "total": windows.len(), "windows": windows }))
}

/// Serve until ctrl-c; on shutdown, flush outstanding audio on every live
/// session before the process exits.
pub async fn run(service: Arc<RealtimeService>) -> Result<()> {
    let bind_addr = service.config.bind_addr.clone();
    let router = build_router(service.clone());

    let reaper_cancel = CancellationToken::new();
    let reaper = tokio::spawn(service.clone().run_reaper(reaper_cancel.clone()));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("listening on {}", bind_addr);

    let shutdown_service = service.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested, flushing sessions");
            shutdown_service.flush_all_sessions().await;
        })
        .await
        .context("server error")?;

    reaper_cancel.cancel();
    let _ = reaper.await;
    Ok(())
}
