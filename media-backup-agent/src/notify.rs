//! Chat notifications for run lifecycle events.

use crate::config::BackupConfig;
use crate::executor::RunVerdict;
use crate::sink::{DocumentSink, RemoteTarget};
use crate::store::ConfigStore;
use crate::transfer::progress::format_duration;
use crate::utils::device_name;
use crate::ws::{BackupEvent, EventBus};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Notifier {
    sink: Arc<dyn DocumentSink>,
    store: Arc<dyn ConfigStore>,
    device: String,
}

impl Notifier {
    pub fn new(sink: Arc<dyn DocumentSink>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            sink,
            store,
            device: device_name(),
        }
    }

    /// Forward events from `events` until `shutdown` fires.
    pub fn spawn(self, events: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Notifier skipped {} event(s)", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                self.notify(&event).await;
            }
        })
    }

    /// Send the message for `event`, if it has one. Never fails.
    pub async fn notify(&self, event: &BackupEvent) {
        let Some(text) = self.render(event) else {
            return;
        };

        let target = match BackupConfig::load(self.store.as_ref()) {
            Ok(config) if config.is_valid() => RemoteTarget::from_config(&config),
            Ok(_) => return,
            Err(e) => {
                warn!("Could not load settings for notification: {}", e);
                return;
            }
        };

        if let Err(e) = self.sink.send_message(&target, &text).await {
            warn!("Failed to send notification: {}", e);
        }
    }

    fn render(&self, event: &BackupEvent) -> Option<String> {
        match event {
            BackupEvent::RunStarted { trigger, .. } => Some(format!(
                "*Backup started* on {} ({})",
                self.device, trigger
            )),
            BackupEvent::RunFinished {
                verdict,
                sent,
                errors,
                total,
                duration_secs,
                ..
            } => {
                let headline = match verdict {
                    RunVerdict::Completed if *errors == 0 => "Backup completed",
                    RunVerdict::Completed => "Backup completed with errors",
                    RunVerdict::NothingToDo => "Backup finished, nothing new",
                    RunVerdict::NothingDelivered => "Backup failed, nothing delivered",
                    RunVerdict::Cancelled => "Backup cancelled",
                    RunVerdict::AlreadyRunning => return None,
                };
                Some(format!(
                    "*{}* on {}\nSent: {}/{}\nFailed: {}\nDuration: {}",
                    headline,
                    self.device,
                    sent,
                    total,
                    errors,
                    format_duration(*duration_secs)
                ))
            }
            BackupEvent::RunFailed { error, .. } => Some(format!(
                "*Backup could not run* on {}\n{}",
                self.device, error
            )),
            BackupEvent::RunProgress(_) | BackupEvent::HistorySynced { .. } => None,
        }
    }
}
