//! Delivery of scanned files: batching, pacing, retries and progress.

pub mod progress;
pub mod progress_stream;
pub mod retry;
pub mod uploader;

pub use progress::{ProgressReporter, RunPhase, RunProgress};
pub use progress_stream::{ProgressCallback, ProgressStream};
pub use retry::{Pacer, RetryPolicy, TokioPacer};
pub use uploader::{BatchUploader, SkipReason, UploadOutcome, UploadTally};
