//! Shared handle the control surfaces drive the agent through.
//!
//! The HTTP API, the WebSocket, the command listener and the scheduled jobs
//! all hold an `Arc<BackupEngine>` and call it directly.

use crate::config::{keys, BackupConfig};
use crate::dedup::DedupIndex;
use crate::executor::history::{HistoryMerger, SyncSummary};
use crate::executor::manifest::{self, HistoryStats, ManifestEntry};
use crate::executor::{BackupOrchestrator, RunReport};
use crate::sink::{DocumentSink, RemoteTarget};
use crate::store::ConfigStore;
use crate::transfer::{ProgressReporter, RunProgress};
use crate::ws::{BackupEvent, EventBus};
use crate::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub configured: bool,
    pub delivered_files: usize,
    pub last_run_at: Option<DateTime<Utc>>,
    pub progress: RunProgress,
}

pub struct BackupEngine {
    store: Arc<dyn ConfigStore>,
    index: Arc<DedupIndex>,
    orchestrator: Arc<BackupOrchestrator>,
    progress: ProgressReporter,
    events: EventBus,
    sink: Arc<dyn DocumentSink>,
    history: Option<Arc<HistoryMerger>>,
}

impl BackupEngine {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        index: Arc<DedupIndex>,
        orchestrator: Arc<BackupOrchestrator>,
        events: EventBus,
        sink: Arc<dyn DocumentSink>,
    ) -> Self {
        Self {
            store,
            index,
            orchestrator,
            progress: ProgressReporter::new(),
            events,
            sink,
            history: None,
        }
    }

    pub fn with_history(mut self, merger: Arc<HistoryMerger>) -> Self {
        self.history = Some(merger);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn DocumentSink> {
        &self.sink
    }

    pub fn progress(&self) -> RunProgress {
        self.progress.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.orchestrator.is_running()
    }

    pub fn backup_config(&self) -> Result<BackupConfig> {
        BackupConfig::load(self.store.as_ref())
    }

    /// Remote target from the stored credentials, `None` until configured.
    pub fn remote_target(&self) -> Result<Option<RemoteTarget>> {
        let config = self.backup_config()?;
        Ok(config.is_valid().then(|| RemoteTarget::from_config(&config)))
    }

    /// Run a backup to completion on the current task.
    pub async fn run_backup(&self, trigger: &str) -> Result<RunReport> {
        let config = self.backup_config()?;
        let report = self.orchestrator.run(&config, &self.progress, trigger).await?;

        if report.verdict != crate::executor::RunVerdict::AlreadyRunning {
            self.store
                .put_string(keys::LAST_RUN_AT, &Utc::now().to_rfc3339())?;
        }
        Ok(report)
    }

    /// Start a backup in the background. Returns `false` when one is already
    /// in flight.
    pub fn spawn_backup(self: &Arc<Self>, trigger: &str) -> bool {
        if self.is_running() {
            info!("Backup already running, {} request ignored", trigger);
            return false;
        }

        let engine = Arc::clone(self);
        let trigger = trigger.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.run_backup(&trigger).await {
                error!("Backup triggered by {} failed: {}", trigger, e);
            }
        });
        true
    }

    /// Request cancellation of the running backup. Returns `false` when
    /// nothing is running.
    pub fn cancel_backup(&self) -> bool {
        let cancelled = self.orchestrator.cancel(&self.progress);
        if cancelled {
            info!("Cancelling running backup");
        }
        cancelled
    }

    pub fn status(&self) -> Result<EngineStatus> {
        let last_run_at = self
            .store
            .get_string(keys::LAST_RUN_AT)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc));

        Ok(EngineStatus {
            running: self.is_running(),
            configured: self.backup_config()?.is_valid(),
            delivered_files: self.index.len(),
            last_run_at,
            progress: self.progress.snapshot(),
        })
    }

    /// Statistics over the local history, merged with the shared manifest
    /// when one is configured and reachable.
    pub async fn stats(&self) -> HistoryStats {
        let local: Vec<ManifestEntry> = self
            .index
            .entries()
            .iter()
            .map(ManifestEntry::from_dedup)
            .collect();

        let entries = match &self.history {
            Some(merger) => match merger.fetch_entries().await {
                Ok(remote) => manifest::merge(&local, &remote),
                Err(e) => {
                    warn!("Could not fetch shared manifest for stats: {}", e);
                    local
                }
            },
            None => local,
        };

        HistoryStats::from_entries(&entries)
    }

    /// Forget every delivered file so the next run sends everything again.
    pub fn clear_history(&self) -> Result<usize> {
        if self.is_running() {
            return Err(AgentError::Precondition(
                "cannot clear history while a backup is running".to_string(),
            ));
        }
        let removed = self.index.len();
        self.index.clear()?;
        info!("Cleared {} delivered file record(s)", removed);
        Ok(removed)
    }

    pub async fn sync_history(&self) -> Result<SyncSummary> {
        let merger = self
            .history
            .as_ref()
            .ok_or_else(|| AgentError::Config("manifest sync is not configured".to_string()))?;
        if self.is_running() {
            return Err(AgentError::Precondition(
                "cannot sync history while a backup is running".to_string(),
            ));
        }

        let summary = merger.sync_index(&self.index).await?;
        self.events.publish(BackupEvent::HistorySynced {
            entries: summary.entries,
            imported: summary.imported,
        });
        Ok(summary)
    }
}
