//! Event bus for run notifications and the WebSocket that streams it.
//!
//! The orchestrator publishes [`BackupEvent`]s on an [`EventBus`]; the
//! notifier and every connected WebSocket client subscribe independently.

use crate::executor::RunVerdict;
use crate::transfer::RunProgress;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    #[serde(rename = "backup:started")]
    RunStarted { run_id: String, trigger: String },

    #[serde(rename = "backup:progress")]
    RunProgress(RunProgress),

    #[serde(rename = "backup:finished")]
    RunFinished {
        run_id: String,
        success: bool,
        verdict: RunVerdict,
        sent: usize,
        errors: usize,
        total: usize,
        duration_secs: u64,
    },

    /// The run aborted before uploading anything
    #[serde(rename = "backup:failed")]
    RunFailed { run_id: String, error: String },

    #[serde(rename = "history:synced")]
    HistorySynced { entries: usize, imported: usize },
}

/// Commands a WebSocket client may send
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "backup:start")]
    StartBackup,
    #[serde(rename = "backup:cancel")]
    CancelBackup,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Deliver to current subscribers; events with no listener are dropped.
    pub fn publish(&self, event: BackupEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Event delivered to {} subscriber(s)", count),
            Err(_) => debug!("Event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<crate::api::AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, state: crate::api::AppState) {
    info!("WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.engine.events().subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, {} event(s) skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize event: {:?}", e),
            }
        }
    });

    let engine = state.engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(ClientCommand::StartBackup) => {
                        engine.spawn_backup("websocket");
                    }
                    Ok(ClientCommand::CancelBackup) => {
                        engine.cancel_backup();
                    }
                    Err(e) => warn!("Ignoring unknown WebSocket command: {}", e),
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
