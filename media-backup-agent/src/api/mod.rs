//! HTTP control API for the backup agent.

pub mod backup;
pub mod health;

use crate::engine::BackupEngine;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BackupEngine>,
}

impl AppState {
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        Self { engine }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/status", get(backup::status))
        .route("/progress", get(backup::progress))
        .route("/backup/start", post(backup::start_backup))
        .route("/backup/cancel", post(backup::cancel_backup))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
