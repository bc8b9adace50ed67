//! Backup control endpoints.

use super::AppState;
use crate::engine::EngineStatus;
use crate::transfer::RunProgress;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub status: &'static str,
}

/// POST /backup/start - Start a backup in the background
pub async fn start_backup(State(state): State<AppState>) -> (StatusCode, Json<ActionResponse>) {
    if state.engine.spawn_backup("api") {
        (
            StatusCode::ACCEPTED,
            Json(ActionResponse { status: "started" }),
        )
    } else {
        (
            StatusCode::CONFLICT,
            Json(ActionResponse {
                status: "already_running",
            }),
        )
    }
}

/// POST /backup/cancel - Cancel the running backup
pub async fn cancel_backup(
    State(state): State<AppState>,
) -> Result<Json<ActionResponse>, StatusCode> {
    if state.engine.cancel_backup() {
        Ok(Json(ActionResponse {
            status: "cancelling",
        }))
    } else {
        tracing::warn!("Cancel requested but no backup is running");
        Err(StatusCode::NOT_FOUND)
    }
}

/// GET /progress - Live progress of the current or last run
pub async fn progress(State(state): State<AppState>) -> Json<RunProgress> {
    Json(state.engine.progress())
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Result<Json<EngineStatus>, StatusCode> {
    state.engine.status().map(Json).map_err(|e| {
        tracing::error!("Failed to read status: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
