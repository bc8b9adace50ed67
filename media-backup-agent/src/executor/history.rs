//! Fetch-merge-publish of the shared delivery manifest.

use super::manifest::{self, ManifestEntry};
use crate::dedup::{DedupEntry, DedupIndex, MergeRule};
use crate::{AgentError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Manifest content together with the token needed to overwrite it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedManifest {
    pub entries: Vec<ManifestEntry>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { version: String },
    /// The remote changed since `expected_version` was read
    Conflict,
}

/// Remote storage for the manifest with compare-and-swap writes.
#[async_trait]
pub trait ManifestRemote: Send + Sync {
    /// `None` when no manifest has been published yet.
    async fn fetch(&self) -> Result<Option<VersionedManifest>>;

    /// Replace the manifest only if its version is still `expected_version`
    /// (`None` meaning it must not exist yet).
    async fn publish(&self, content: &str, expected_version: Option<&str>)
        -> Result<PublishOutcome>;
}

/// Result of reconciling the local index with the remote manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    /// Entries in the published manifest
    pub entries: usize,
    /// Deliveries made elsewhere that were added to the local index
    pub imported: usize,
}

pub struct HistoryMerger {
    remote: Arc<dyn ManifestRemote>,
    max_bytes: usize,
    conflict_retries: u32,
}

impl HistoryMerger {
    pub fn new(remote: Arc<dyn ManifestRemote>, max_bytes: usize) -> Self {
        Self {
            remote,
            max_bytes,
            conflict_retries: 1,
        }
    }

    /// Merge `local` into the remote manifest and publish the result.
    ///
    /// A version conflict triggers one fresh fetch-merge-publish cycle.
    /// Returns the merged manifest that was published.
    pub async fn sync(&self, local: &[ManifestEntry]) -> Result<Vec<ManifestEntry>> {
        for attempt in 0..=self.conflict_retries {
            let current = self.remote.fetch().await?;
            let (remote_entries, version) = match &current {
                Some(m) => (m.entries.as_slice(), Some(m.version.as_str())),
                None => (&[][..], None),
            };

            let merged = manifest::merge(local, remote_entries);
            let rendered = manifest::render(&merged)?;
            if rendered.len() > self.max_bytes {
                return Err(AgentError::Manifest(format!(
                    "merged manifest is {} bytes, limit is {}",
                    rendered.len(),
                    self.max_bytes
                )));
            }

            match self.remote.publish(&rendered, version).await? {
                PublishOutcome::Published { version } => {
                    info!(
                        "Published manifest with {} entries (version {})",
                        merged.len(),
                        version
                    );
                    return Ok(merged);
                }
                PublishOutcome::Conflict => {
                    warn!("Manifest changed remotely (attempt {}), refetching", attempt + 1);
                }
            }
        }

        Err(AgentError::Manifest(
            "manifest kept changing during publish".to_string(),
        ))
    }

    /// Publish the local index, then adopt successful deliveries that only
    /// the remote knows about so they are not sent again.
    pub async fn sync_index(&self, index: &DedupIndex) -> Result<SyncSummary> {
        let local: Vec<ManifestEntry> = index
            .entries()
            .iter()
            .map(ManifestEntry::from_dedup)
            .collect();
        let merged = self.sync(&local).await?;

        let remote_only: Vec<DedupEntry> = merged
            .iter()
            .filter(|e| !index.contains(&e.file_hash))
            .filter_map(ManifestEntry::to_dedup)
            .collect();
        let imported = if remote_only.is_empty() {
            0
        } else {
            index.import_snapshot(remote_only, MergeRule::LastWriteWins)?
        };

        Ok(SyncSummary {
            entries: merged.len(),
            imported,
        })
    }

    /// Current remote manifest, empty when none exists.
    pub async fn fetch_entries(&self) -> Result<Vec<ManifestEntry>> {
        Ok(self
            .remote
            .fetch()
            .await?
            .map(|m| m.entries)
            .unwrap_or_default())
    }
}
