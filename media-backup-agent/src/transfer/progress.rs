//! Live state of the backup run in flight.
//!
//! [`ProgressReporter`] is a cheap clonable handle. The orchestrator and the
//! uploader write through it; any number of readers either poll
//! [`ProgressReporter::snapshot`] or [`ProgressReporter::subscribe`] for
//! pushed updates. Every write replaces the whole [`RunProgress`] value
//! atomically, so readers never see a half-updated record.

use crate::fs::{FileRecord, MediaCategory};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Initializing,
    CheckingPreconditions,
    ScanningPriority,
    UploadingPriority,
    ScanningFull,
    UploadingFull,
    Finalizing,
    Done,
}

impl RunPhase {
    pub fn is_active(&self) -> bool {
        !matches!(self, RunPhase::Idle | RunPhase::Done)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunProgress {
    pub current_file: Option<String>,
    pub phase: RunPhase,
    /// Label of the batch being uploaded ("images", "videos")
    pub category: Option<String>,
    pub files_done: usize,
    pub files_total: usize,
    pub sent: usize,
    pub errors: usize,
    pub current_file_bytes_done: u64,
    pub current_file_bytes_total: u64,
    /// Upload speed of the current file
    pub bytes_per_second: u64,
    pub cancelled: bool,
}

impl RunProgress {
    /// Percentage of files processed (0-100)
    pub fn percent_complete(&self) -> f64 {
        if self.files_total == 0 {
            0.0
        } else {
            (self.files_done as f64 / self.files_total as f64) * 100.0
        }
    }
}

struct Inner {
    tx: watch::Sender<RunProgress>,
    cancel: Mutex<CancellationToken>,
    file_started: Mutex<Option<Instant>>,
}

/// Shared handle on the current [`RunProgress`] and its cancellation flag.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("progress", &self.snapshot())
            .finish()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunProgress::default());
        Self {
            inner: Arc::new(Inner {
                tx,
                cancel: Mutex::new(CancellationToken::new()),
                file_started: Mutex::new(None),
            }),
        }
    }

    /// Start a fresh run: zeroed counters and a new cancellation token.
    pub fn reset(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.inner.cancel.lock() = token.clone();
        *self.inner.file_started.lock() = None;
        self.inner.tx.send_replace(RunProgress {
            phase: RunPhase::Initializing,
            ..RunProgress::default()
        });
        token
    }

    pub fn snapshot(&self) -> RunProgress {
        self.inner.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunProgress> {
        self.inner.tx.subscribe()
    }

    /// Apply `f` to the current state and publish the result.
    pub fn update(&self, f: impl FnOnce(&mut RunProgress)) {
        self.inner.tx.send_modify(f);
    }

    pub fn set_phase(&self, phase: RunPhase) {
        self.update(|p| p.phase = phase);
    }

    /// Announce a new batch of `count` files.
    pub fn begin_batch(&self, label: &str, count: usize) {
        self.update(|p| {
            p.category = Some(label.to_string());
            p.files_total += count;
        });
    }

    /// Announce the file about to be attempted.
    pub fn begin_file(&self, file: &FileRecord) {
        *self.inner.file_started.lock() = Some(Instant::now());
        let name = file.file_name();
        self.update(|p| {
            p.current_file = Some(name);
            p.current_file_bytes_done = 0;
            p.current_file_bytes_total = file.size;
            p.bytes_per_second = 0;
        });
    }

    pub fn file_bytes(&self, bytes_done: u64) {
        let elapsed = self
            .inner
            .file_started
            .lock()
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.update(|p| {
            p.current_file_bytes_done = bytes_done;
            if elapsed > 0.0 {
                p.bytes_per_second = (bytes_done as f64 / elapsed) as u64;
            }
        });
    }

    /// Count a file as processed.
    pub fn finish_file(&self, sent: bool, failed: bool) {
        self.update(|p| {
            p.files_done += 1;
            if sent {
                p.sent += 1;
            }
            if failed {
                p.errors += 1;
            }
        });
    }

    /// Request cooperative cancellation of the current run.
    pub fn cancel(&self) {
        self.inner.cancel.lock().cancel();
        self.update(|p| p.cancelled = true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.lock().is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.lock().clone()
    }
}

/// Human-readable label for a category batch
pub fn category_label(category: MediaCategory) -> &'static str {
    match category {
        MediaCategory::Video => "videos",
        MediaCategory::Image | MediaCategory::Other => "images",
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
