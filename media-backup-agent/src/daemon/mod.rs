//! Long-running agent: scheduled jobs, notifications and the control API.

pub mod runtime;
pub mod shutdown;

use crate::api::{self, AppState};
use crate::commands::CommandListener;
use crate::config::{keys, BackupConfig, Config};
use crate::connectivity::TcpProbe;
use crate::dedup::DedupIndex;
use crate::engine::BackupEngine;
use crate::executor::github::GitHubManifestRemote;
use crate::executor::history::HistoryMerger;
use crate::executor::BackupOrchestrator;
use crate::notify::Notifier;
use crate::scheduler::{CronJobHost, JobName, PeriodicScheduler};
use crate::sink::TelegramSink;
use crate::store::{ConfigStore, SqliteStore};
use crate::transfer::{BatchUploader, TokioPacer};
use crate::ws::EventBus;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub use runtime::AgentRuntime;
pub use shutdown::ShutdownCoordinator;

/// Everything a daemon or a one-off CLI run needs.
pub struct Components {
    pub store: Arc<SqliteStore>,
    pub telegram: Arc<TelegramSink>,
    pub engine: Arc<BackupEngine>,
}

/// Open the store and wire the engine from `config`.
pub fn build(config: &Config) -> crate::Result<Components> {
    std::fs::create_dir_all(&config.agent.data_dir)?;
    let store = Arc::new(SqliteStore::open(&config.db_path())?);
    let index = Arc::new(DedupIndex::open(store.clone())?);
    let telegram = Arc::new(TelegramSink::new(&config.remote)?);
    let events = EventBus::new();

    let uploader = BatchUploader::new(telegram.clone(), index.clone(), Arc::new(TokioPacer));
    let mut orchestrator = BackupOrchestrator::new(
        config.agent.storage_root.clone(),
        index.clone(),
        uploader,
        Arc::new(TcpProbe::for_url(&config.remote.api_base)),
        events.clone(),
    );

    let history = history_merger(config, store.as_ref())?;
    if let Some(merger) = &history {
        orchestrator = orchestrator.with_history(Arc::clone(merger));
    }

    let mut engine = BackupEngine::new(
        store.clone(),
        index,
        Arc::new(orchestrator),
        events,
        telegram.clone(),
    );
    if let Some(merger) = history {
        engine = engine.with_history(merger);
    }

    Ok(Components {
        store,
        telegram,
        engine: Arc::new(engine),
    })
}

/// Shared manifest sync is enabled when an owner is configured and a token
/// has been stored.
fn history_merger(
    config: &Config,
    store: &dyn ConfigStore,
) -> crate::Result<Option<Arc<HistoryMerger>>> {
    if config.manifest.owner.is_none() {
        return Ok(None);
    }
    let token = store.get_string(keys::GITHUB_TOKEN)?.unwrap_or_default();
    if token.trim().is_empty() {
        warn!("Manifest owner set but no {} stored, history sync disabled", keys::GITHUB_TOKEN);
        return Ok(None);
    }

    let remote = GitHubManifestRemote::new(&config.manifest, &token)?;
    Ok(Some(Arc::new(HistoryMerger::new(
        Arc::new(remote),
        config.manifest.max_bytes,
    ))))
}

async fn register_jobs(
    scheduler: &PeriodicScheduler,
    config: &Config,
    backup: &BackupConfig,
) {
    let jobs = [
        (JobName::Backup, backup.interval()),
        (
            JobName::CommandListener,
            Duration::from_secs(config.schedule.listener_delay_secs),
        ),
        (
            JobName::Watchdog,
            Duration::from_secs(config.schedule.watchdog_minutes * 60),
        ),
    ];

    for (job, interval) in jobs {
        // The watchdog resubmits anything that failed here.
        if let Err(e) = scheduler.schedule_recurring(job.as_str(), interval).await {
            error!("Failed to register {} job: {}", job.as_str(), e);
        }
    }
}

pub async fn run_daemon(config: Config, port: u16) -> anyhow::Result<()> {
    let Components { telegram, engine, .. } = build(&config)?;

    let shutdown = ShutdownCoordinator::new();
    let notifier = Notifier::new(telegram.clone(), engine.store().clone())
        .spawn(engine.events(), shutdown.token());

    let host = Arc::new(CronJobHost::new().await?);
    let scheduler = Arc::new(PeriodicScheduler::new(host.clone()));
    let listener = CommandListener::new(telegram, engine.clone());
    let runtime = AgentRuntime::new(engine.clone(), listener, scheduler.clone());
    host.bind(Arc::new(runtime))?;
    host.start().await?;
    register_jobs(&scheduler, &config, &engine.backup_config()?).await;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = api::create_router(AppState::new(engine.clone()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let server_token = shutdown.token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
    });

    shutdown.wait_for_signal().await;

    engine.cancel_backup();
    if let Err(e) = host.shutdown().await {
        warn!("Scheduler shutdown failed: {}", e);
    }
    let _ = tokio::time::timeout(Duration::from_secs(3), notifier).await;

    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => error!("Server task panicked: {}", e),
        Err(_) => warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}
