//! Sequential, batched upload of candidate files.
//!
//! Files go out one at a time in the order given. Within a batch each file
//! is followed by the inter-file delay, and each batch by the inter-batch
//! delay; neither is applied after the last item. Cancellation is checked
//! before every file and interrupts any pending wait.

use super::progress::ProgressReporter;
use super::progress_stream::ProgressCallback;
use super::retry::{Pacer, RetryPolicy};
use crate::config::BackupConfig;
use crate::dedup::{DedupEntry, DedupIndex};
use crate::fs::FileRecord;
use crate::sink::{DocumentSink, ErrorKind, RemoteTarget};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Missing,
    Empty,
    AlreadyDelivered,
    Cancelled,
}

/// Result of handling one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Sent { remote_ref: Option<String> },
    Skipped(SkipReason),
    Failed(String),
}

/// Counts for one `upload` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadTally {
    pub sent: usize,
    pub errors: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl UploadTally {
    pub fn absorb(&mut self, other: UploadTally) {
        self.sent += other.sent;
        self.errors += other.errors;
        self.skipped += other.skipped;
        self.cancelled |= other.cancelled;
    }
}

pub struct BatchUploader {
    sink: Arc<dyn DocumentSink>,
    index: Arc<DedupIndex>,
    pacer: Arc<dyn Pacer>,
    policy: RetryPolicy,
}

impl BatchUploader {
    pub fn new(sink: Arc<dyn DocumentSink>, index: Arc<DedupIndex>, pacer: Arc<dyn Pacer>) -> Self {
        Self {
            sink,
            index,
            pacer,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upload `files` in chunks of `batch_size`.
    ///
    /// A failed file never stops the batch. On cancellation the partial
    /// counts are returned and everything already sent stays indexed.
    pub async fn upload(
        &self,
        config: &BackupConfig,
        files: &[FileRecord],
        batch_size: usize,
        label: &str,
        progress: &ProgressReporter,
    ) -> UploadTally {
        let mut tally = UploadTally::default();
        if files.is_empty() {
            return tally;
        }

        let target = RemoteTarget::from_config(config);
        let cancel = progress.cancel_token();
        let batches: Vec<&[FileRecord]> = files.chunks(batch_size.max(1)).collect();
        let batch_count = batches.len();

        progress.begin_batch(label, files.len());
        info!(
            "Uploading {} {} in {} batch(es) of up to {}",
            files.len(),
            label,
            batch_count,
            batch_size.max(1)
        );

        for (batch_no, batch) in batches.into_iter().enumerate() {
            for (i, file) in batch.iter().enumerate() {
                if cancel.is_cancelled() {
                    info!("Upload of {} cancelled", label);
                    tally.cancelled = true;
                    return tally;
                }

                progress.begin_file(file);
                let outcome = self.deliver(&target, file, progress, &cancel).await;

                match &outcome {
                    UploadOutcome::Sent { .. } => tally.sent += 1,
                    UploadOutcome::Failed(reason) => {
                        warn!(file = %file.path.display(), "Upload failed: {}", reason);
                        tally.errors += 1;
                    }
                    UploadOutcome::Skipped(SkipReason::Cancelled) => {
                        tally.cancelled = true;
                        return tally;
                    }
                    UploadOutcome::Skipped(reason) => {
                        debug!(file = %file.path.display(), "Skipped: {:?}", reason);
                        tally.skipped += 1;
                    }
                }
                progress.finish_file(
                    matches!(outcome, UploadOutcome::Sent { .. }),
                    matches!(outcome, UploadOutcome::Failed(_)),
                );

                if i + 1 < batch.len() && !self.pace(config.inter_file_delay(), &cancel).await {
                    tally.cancelled = true;
                    return tally;
                }
            }

            if batch_no + 1 < batch_count {
                debug!(
                    "Batch {}/{} of {} done, pausing {:?}",
                    batch_no + 1,
                    batch_count,
                    label,
                    config.inter_batch_delay()
                );
                if !self.pace(config.inter_batch_delay(), &cancel).await {
                    tally.cancelled = true;
                    return tally;
                }
            }
        }

        info!(
            "Finished {}: {} sent, {} failed, {} skipped",
            label, tally.sent, tally.errors, tally.skipped
        );
        tally
    }

    /// Preflight, then up to `max_attempts` deliveries of one file.
    pub async fn deliver(
        &self,
        target: &RemoteTarget,
        file: &FileRecord,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        if let Some(outcome) = self.preflight(file).await {
            return outcome;
        }

        let mut last_error = String::new();
        // Rate-limit waits use the server hint and leave the backoff alone.
        let mut transient_failures = 0;
        for attempt in 1..=self.policy.max_attempts {
            let reporter = progress.clone();
            let callback: ProgressCallback = Arc::new(move |bytes| reporter.file_bytes(bytes));

            let err = match self.sink.send_document(target, file, callback).await {
                Ok(delivery) => {
                    let entry = DedupEntry::delivered(file, delivery.remote_ref.clone(), Utc::now());
                    if let Err(e) = self.index.add(entry) {
                        error!(
                            file = %file.path.display(),
                            "Delivered but failed to record in index: {}", e
                        );
                    }
                    debug!(file = %file.path.display(), attempt, "Delivered");
                    return UploadOutcome::Sent {
                        remote_ref: delivery.remote_ref,
                    };
                }
                Err(e) => e,
            };

            last_error = err.to_string();
            let wait = match err.kind() {
                ErrorKind::Permanent => return UploadOutcome::Failed(last_error),
                ErrorKind::Precondition => return UploadOutcome::Skipped(SkipReason::Missing),
                ErrorKind::RateLimited { retry_after } => self.policy.rate_limit_wait(retry_after),
                ErrorKind::Transient => {
                    transient_failures += 1;
                    self.policy.backoff(transient_failures)
                }
            };

            if attempt == self.policy.max_attempts {
                break;
            }

            warn!(
                file = %file.path.display(),
                attempt,
                wait_ms = wait.as_millis() as u64,
                "Attempt failed, retrying: {}", last_error
            );
            if !self.pacer.pause(wait, cancel).await {
                return UploadOutcome::Skipped(SkipReason::Cancelled);
            }
        }

        UploadOutcome::Failed(format!(
            "gave up after {} attempts: {}",
            self.policy.max_attempts, last_error
        ))
    }

    async fn preflight(&self, file: &FileRecord) -> Option<UploadOutcome> {
        let metadata = match tokio::fs::metadata(&file.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Some(UploadOutcome::Skipped(SkipReason::Missing));
            }
            Err(e) => return Some(UploadOutcome::Failed(format!("unreadable: {e}"))),
        };

        if metadata.len() == 0 {
            return Some(UploadOutcome::Skipped(SkipReason::Empty));
        }

        let limit = self.sink.max_payload_bytes();
        if metadata.len() > limit {
            return Some(UploadOutcome::Failed(format!(
                "{} bytes exceeds the {} byte limit",
                metadata.len(),
                limit
            )));
        }

        if let Err(e) = tokio::fs::File::open(&file.path).await {
            return Some(UploadOutcome::Failed(format!("unreadable: {e}")));
        }

        if self.index.contains(&file.content_hash) {
            return Some(UploadOutcome::Skipped(SkipReason::AlreadyDelivered));
        }

        None
    }

    /// Zero delays are not paced at all.
    async fn pace(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        self.pacer.pause(delay, cancel).await
    }
}
