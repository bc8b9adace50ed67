//! Filesystem discovery: file records, content hashing and the two-phase scanner.

pub mod hashing;
pub mod record;
pub mod walker;

pub use record::{FileRecord, MediaCategory};
pub use walker::{Exclusion, FileScanner, ScanOptions, ScanPhase};
