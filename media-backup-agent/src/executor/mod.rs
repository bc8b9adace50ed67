//! Backup run orchestration.
//!
//! A run moves through a fixed sequence of phases:
//! init, precondition check, priority scan, priority upload, full scan,
//! full upload, finalize. Each upload step sends images (and other
//! documents) before videos, each with its own batch size.

pub mod github;
pub mod history;
pub mod manifest;

use crate::config::BackupConfig;
use crate::connectivity::Connectivity;
use crate::dedup::DedupIndex;
use crate::fs::{FileRecord, FileScanner, ScanOptions, ScanPhase};
use crate::transfer::{BatchUploader, ProgressReporter, RunPhase, UploadTally};
use crate::ws::{BackupEvent, EventBus};
use crate::{AgentError, Result};
use history::HistoryMerger;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often live progress is pushed to event subscribers
const PROGRESS_BROADCAST_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    /// At least one file was delivered
    Completed,
    /// No candidates were found
    NothingToDo,
    /// Candidates existed but none was delivered
    NothingDelivered,
    Cancelled,
    /// Another run held the lock; nothing was done
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub verdict: RunVerdict,
    pub sent: usize,
    pub errors: usize,
    pub skipped: usize,
    /// Candidates found across both scan phases
    pub total: usize,
    pub duration_secs: u64,
}

impl RunReport {
    fn already_running() -> Self {
        Self {
            run_id: String::new(),
            verdict: RunVerdict::AlreadyRunning,
            sent: 0,
            errors: 0,
            skipped: 0,
            total: 0,
            duration_secs: 0,
        }
    }

    /// Best effort: failure only when candidates existed and none went out.
    pub fn is_success(&self) -> bool {
        match self.verdict {
            RunVerdict::Completed | RunVerdict::NothingToDo | RunVerdict::AlreadyRunning => true,
            RunVerdict::NothingDelivered => false,
            RunVerdict::Cancelled => self.sent > 0 || self.total == 0,
        }
    }
}

/// Resets the running flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BackupOrchestrator {
    storage_root: PathBuf,
    index: Arc<DedupIndex>,
    uploader: BatchUploader,
    connectivity: Arc<dyn Connectivity>,
    events: EventBus,
    history: Option<Arc<HistoryMerger>>,
    running: AtomicBool,
    /// Held while a run starts and while a cancel is applied
    control: Mutex<()>,
}

impl BackupOrchestrator {
    pub fn new(
        storage_root: impl Into<PathBuf>,
        index: Arc<DedupIndex>,
        uploader: BatchUploader,
        connectivity: Arc<dyn Connectivity>,
        events: EventBus,
    ) -> Self {
        Self {
            storage_root: storage_root.into(),
            index,
            uploader,
            connectivity,
            events,
            history: None,
            running: AtomicBool::new(false),
            control: Mutex::new(()),
        }
    }

    /// Publish the delivery history after every run that sent something.
    pub fn with_history(mut self, merger: Arc<HistoryMerger>) -> Self {
        self.history = Some(merger);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cancel the run in flight. Returns `false` when nothing is running.
    pub fn cancel(&self, progress: &ProgressReporter) -> bool {
        let _control = self.control.lock();
        if !self.is_running() {
            return false;
        }
        progress.cancel();
        true
    }

    /// Take the run lock and arm a fresh cancellation token for the run.
    fn begin(&self, progress: &ProgressReporter) -> Option<RunGuard<'_>> {
        let _control = self.control.lock();
        let guard = RunGuard::acquire(&self.running)?;
        progress.reset();
        Some(guard)
    }

    /// Execute one full backup run.
    ///
    /// Returns `Err` only for precondition failures and internal errors;
    /// per-file failures are counted in the report. A call made while a run
    /// is in flight returns immediately with [`RunVerdict::AlreadyRunning`].
    pub async fn run(
        &self,
        config: &BackupConfig,
        progress: &ProgressReporter,
        trigger: &str,
    ) -> Result<RunReport> {
        let _guard = match self.begin(progress) {
            Some(guard) => guard,
            None => {
                info!("Backup already in progress, ignoring {} trigger", trigger);
                return Ok(RunReport::already_running());
            }
        };

        let run_id = uuid::Uuid::new_v4().to_string();
        let start_time = Instant::now();

        info!("Starting backup run {} ({})", run_id, trigger);
        self.events.publish(BackupEvent::RunStarted {
            run_id: run_id.clone(),
            trigger: trigger.to_string(),
        });

        let stop_broadcast = CancellationToken::new();
        let broadcaster = self.spawn_progress_broadcast(progress, stop_broadcast.clone());

        let result = self.execute(config, progress).await;

        stop_broadcast.cancel();
        let _ = broadcaster.await;

        let (tally, total) = match result {
            Ok(counts) => counts,
            Err(e) => {
                error!("Backup run {} failed: {}", run_id, e);
                progress.set_phase(RunPhase::Done);
                self.events.publish(BackupEvent::RunFailed {
                    run_id,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        progress.set_phase(RunPhase::Finalizing);
        let verdict = if tally.cancelled {
            RunVerdict::Cancelled
        } else if total == 0 {
            RunVerdict::NothingToDo
        } else if tally.sent == 0 {
            RunVerdict::NothingDelivered
        } else {
            RunVerdict::Completed
        };

        if tally.sent > 0 {
            self.publish_history().await;
        }

        let report = RunReport {
            run_id,
            verdict,
            sent: tally.sent,
            errors: tally.errors,
            skipped: tally.skipped,
            total,
            duration_secs: start_time.elapsed().as_secs(),
        };

        info!(
            "Backup run {} finished: {:?}, {} sent, {} failed, {} candidates, {}s",
            report.run_id,
            report.verdict,
            report.sent,
            report.errors,
            report.total,
            report.duration_secs
        );

        progress.set_phase(RunPhase::Done);
        self.events.publish(BackupEvent::RunProgress(progress.snapshot()));
        self.events.publish(BackupEvent::RunFinished {
            run_id: report.run_id.clone(),
            success: report.is_success(),
            verdict: report.verdict,
            sent: report.sent,
            errors: report.errors,
            total: report.total,
            duration_secs: report.duration_secs,
        });

        Ok(report)
    }

    async fn execute(
        &self,
        config: &BackupConfig,
        progress: &ProgressReporter,
    ) -> Result<(UploadTally, usize)> {
        progress.set_phase(RunPhase::CheckingPreconditions);
        if !config.is_valid() {
            return Err(AgentError::Precondition(
                "remote token and target id must be configured".to_string(),
            ));
        }
        let network = self.connectivity.status().await;
        if !network.allows_backup(config.force_on_metered_network) {
            return Err(AgentError::Precondition(format!(
                "network not usable for backup ({:?})",
                network
            )));
        }

        let scanner = FileScanner::new(self.storage_root.clone(), ScanOptions::from_config(config));
        let mut tally = UploadTally::default();
        let mut total = 0usize;
        let mut attempted: HashSet<String> = HashSet::new();

        let steps = [
            (ScanPhase::Priority, RunPhase::ScanningPriority, RunPhase::UploadingPriority),
            (ScanPhase::Full, RunPhase::ScanningFull, RunPhase::UploadingFull),
        ];

        for (scan_phase, scanning, uploading) in steps {
            if progress.is_cancelled() {
                tally.cancelled = true;
                break;
            }

            progress.set_phase(scanning);
            let mut files = self.scan(&scanner, scan_phase).await?;
            files.retain(|f| !attempted.contains(&f.content_hash));
            attempted.extend(files.iter().map(|f| f.content_hash.clone()));
            total += files.len();
            info!("{:?} scan found {} candidate(s)", scan_phase, files.len());

            progress.set_phase(uploading);
            let (videos, images): (Vec<FileRecord>, Vec<FileRecord>) =
                files.into_iter().partition(|f| f.category.is_video_like());

            tally.absorb(
                self.uploader
                    .upload(config, &images, config.batch_size_images, "images", progress)
                    .await,
            );
            if tally.cancelled {
                break;
            }

            tally.absorb(
                self.uploader
                    .upload(config, &videos, config.batch_size_videos, "videos", progress)
                    .await,
            );
            if tally.cancelled {
                break;
            }
        }

        Ok((tally, total))
    }

    /// Directory walks and hashing run on the blocking pool.
    async fn scan(&self, scanner: &FileScanner, phase: ScanPhase) -> Result<Vec<FileRecord>> {
        let scanner = scanner.clone();
        let index = Arc::clone(&self.index);
        let files = tokio::task::spawn_blocking(move || scanner.scan(phase, &index)).await?;
        Ok(files)
    }

    async fn publish_history(&self) {
        let Some(merger) = &self.history else {
            return;
        };
        match merger.sync_index(&self.index).await {
            Ok(summary) => self.events.publish(BackupEvent::HistorySynced {
                entries: summary.entries,
                imported: summary.imported,
            }),
            Err(e) => warn!("History sync failed: {}", e),
        }
    }

    /// Push progress snapshots to subscribers while the run is active.
    fn spawn_progress_broadcast(
        &self,
        progress: &ProgressReporter,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let events = self.events.clone();
        let mut rx = progress.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_BROADCAST_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }

                if rx.has_changed().unwrap_or(false) {
                    let snapshot = rx.borrow_and_update().clone();
                    events.publish(BackupEvent::RunProgress(snapshot));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::{NetworkStatus, StaticConnectivity};
    use crate::sink::DeliveryError;
    use crate::store::MemoryStore;
    use crate::testing::{FakeManifestRemote, FakeSink};
    use crate::transfer::retry::testing::RecordingPacer;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        sink: Arc<FakeSink>,
        index: Arc<DedupIndex>,
        events: EventBus,
        orchestrator: BackupOrchestrator,
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture_with(sink: FakeSink, network: NetworkStatus) -> Fixture {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "DCIM/Camera/photo1.jpg", "photo one");
        write(dir.path(), "DCIM/Camera/clip1.mp4", "clip one");
        write(dir.path(), "Pictures/shot.png", "screenshot");
        write(dir.path(), "Download/meme.jpg", "meme");
        write(dir.path(), "Movies/film.mov", "film");

        let sink = Arc::new(sink);
        let index = Arc::new(DedupIndex::open(Arc::new(MemoryStore::new())).unwrap());
        let uploader = BatchUploader::new(
            sink.clone(),
            index.clone(),
            Arc::new(RecordingPacer::default()),
        );
        let events = EventBus::new();
        let orchestrator = BackupOrchestrator::new(
            dir.path(),
            index.clone(),
            uploader,
            Arc::new(StaticConnectivity(network)),
            events.clone(),
        );

        Fixture {
            dir,
            sink,
            index,
            events,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeSink::new(), NetworkStatus::Unmetered)
    }

    fn config() -> BackupConfig {
        BackupConfig {
            remote_token: "1:abc".into(),
            remote_target_id: "42".into(),
            ..BackupConfig::default()
        }
    }

    #[tokio::test]
    async fn test_phase_and_category_ordering() {
        let f = fixture();
        let progress = ProgressReporter::new();

        let report = f.orchestrator.run(&config(), &progress, "test").await.unwrap();

        assert_eq!(report.verdict, RunVerdict::Completed);
        assert_eq!(report.sent, 5);
        assert_eq!(report.total, 5);
        assert!(report.is_success());

        let sent = f.sink.sent_names();
        // Priority folder images, priority videos, then the rest
        let (priority, rest) = sent.split_at(3);
        assert_eq!(priority[2], "clip1.mp4");
        assert!(priority[..2].contains(&"photo1.jpg".to_string()));
        assert!(priority[..2].contains(&"shot.png".to_string()));
        assert_eq!(rest, &["meme.jpg".to_string(), "film.mov".to_string()]);

        assert_eq!(f.index.len(), 5);
        assert_eq!(progress.snapshot().phase, RunPhase::Done);
    }

    #[test]
    fn test_cancel_right_after_start_is_kept() {
        let f = fixture();
        for _ in 0..200 {
            let progress = ProgressReporter::new();
            std::thread::scope(|scope| {
                let canceller = scope.spawn(|| {
                    while !f.orchestrator.cancel(&progress) {
                        std::thread::yield_now();
                    }
                });
                let guard = f.orchestrator.begin(&progress).unwrap();
                canceller.join().unwrap();
                assert!(progress.is_cancelled());
                drop(guard);
            });
        }

        let idle = ProgressReporter::new();
        assert!(!f.orchestrator.cancel(&idle));
        assert!(!idle.is_cancelled());
    }

    #[tokio::test]
    async fn test_second_run_sends_nothing() {
        let f = fixture();
        let progress = ProgressReporter::new();

        f.orchestrator.run(&config(), &progress, "first").await.unwrap();
        let second = f.orchestrator.run(&config(), &progress, "second").await.unwrap();

        assert_eq!(second.sent, 0);
        assert_eq!(second.errors, 0);
        assert_eq!(second.verdict, RunVerdict::NothingToDo);
        assert!(second.is_success());
        assert_eq!(f.sink.attempt_count(), 5);
    }

    #[tokio::test]
    async fn test_new_file_picked_up_on_next_run() {
        let f = fixture();
        let progress = ProgressReporter::new();
        f.orchestrator.run(&config(), &progress, "first").await.unwrap();

        write(f.dir.path(), "DCIM/Camera/photo2.jpg", "photo two");
        let report = f.orchestrator.run(&config(), &progress, "second").await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(f.sink.sent_names().last().unwrap(), "photo2.jpg");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_scanning() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        let progress = ProgressReporter::new();

        let err = f
            .orchestrator
            .run(&BackupConfig::default(), &progress, "test")
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Precondition(_)));
        assert_eq!(f.sink.attempt_count(), 0);
        assert!(!f.orchestrator.is_running());

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BackupEvent::RunFailed { .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_network_preconditions() {
        let offline = fixture_with(FakeSink::new(), NetworkStatus::Offline);
        let progress = ProgressReporter::new();
        assert!(matches!(
            offline.orchestrator.run(&config(), &progress, "t").await,
            Err(AgentError::Precondition(_))
        ));

        let metered = fixture_with(FakeSink::new(), NetworkStatus::Metered);
        assert!(metered.orchestrator.run(&config(), &progress, "t").await.is_err());

        let forced = BackupConfig {
            force_on_metered_network: true,
            ..config()
        };
        let report = metered.orchestrator.run(&forced, &progress, "t").await.unwrap();
        assert_eq!(report.sent, 5);
    }

    #[tokio::test]
    async fn test_nothing_delivered_is_failure() {
        let sink = FakeSink::new();
        for _ in 0..5 {
            sink.push_response(Err(DeliveryError::Rejected {
                status: 403,
                message: "bot was blocked".into(),
            }));
        }
        let f = fixture_with(sink, NetworkStatus::Unmetered);
        let progress = ProgressReporter::new();

        let report = f.orchestrator.run(&config(), &progress, "t").await.unwrap();
        assert_eq!(report.verdict, RunVerdict::NothingDelivered);
        assert_eq!(report.errors, 5);
        assert!(!report.is_success());
        assert!(f.index.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_is_success() {
        let sink = FakeSink::new();
        sink.push_response(Err(DeliveryError::Rejected {
            status: 400,
            message: "bad file".into(),
        }));
        let f = fixture_with(sink, NetworkStatus::Unmetered);
        let progress = ProgressReporter::new();

        let report = f.orchestrator.run(&config(), &progress, "t").await.unwrap();
        assert_eq!(report.sent, 4);
        assert_eq!(report.errors, 1);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_noop() {
        let f = fixture();
        let progress = ProgressReporter::new();

        let _held = RunGuard::acquire(&f.orchestrator.running).unwrap();
        let report = f.orchestrator.run(&config(), &progress, "t").await.unwrap();

        assert_eq!(report.verdict, RunVerdict::AlreadyRunning);
        assert_eq!(f.sink.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_run_and_keeps_sent() {
        let f = fixture();
        let progress = ProgressReporter::new();
        let canceller = progress.clone();
        f.sink.on_success(move |count| {
            if count == 2 {
                canceller.cancel();
            }
        });

        let report = f.orchestrator.run(&config(), &progress, "t").await.unwrap();
        assert_eq!(report.verdict, RunVerdict::Cancelled);
        assert_eq!(report.sent, 2);
        assert_eq!(f.index.len(), 2);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_history_published_after_run() {
        let remote = Arc::new(FakeManifestRemote::default());
        let f = fixture();
        let mut rx = f.events.subscribe();
        let orchestrator = f
            .orchestrator
            .with_history(Arc::new(HistoryMerger::new(remote.clone(), 1024 * 1024)));
        let progress = ProgressReporter::new();

        orchestrator.run(&config(), &progress, "t").await.unwrap();
        assert_eq!(remote.current_entries().len(), 5);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                BackupEvent::RunStarted { .. } => kinds.push("started"),
                BackupEvent::HistorySynced { .. } => kinds.push("synced"),
                BackupEvent::RunFinished { .. } => kinds.push("finished"),
                _ => {}
            }
        }
        assert_eq!(kinds, vec!["started", "synced", "finished"]);
    }
}
