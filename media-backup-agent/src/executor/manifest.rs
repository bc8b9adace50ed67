//! Shared delivery history: the JSON manifest kept on the remote.
//!
//! The wire format is a JSON array of camelCase objects. Optional text
//! fields are written as `""` rather than omitted.

use crate::dedup::DedupEntry;
use crate::fs::MediaCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    #[default]
    Success,
    Failed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    #[serde(default)]
    pub id: i64,
    pub file_name: String,
    #[serde(default)]
    pub file_path: String,
    pub file_hash: String,
    #[serde(default)]
    pub file_size: u64,
    /// "image", "video" or "other"
    #[serde(default)]
    pub file_type: String,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub upload_date: i64,
    #[serde(default)]
    pub upload_status: UploadStatus,
    #[serde(default, with = "blank_as_none")]
    pub telegram_message_id: Option<String>,
    #[serde(default, with = "blank_as_none")]
    pub error_message: Option<String>,
}

mod blank_as_none {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(value.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.filter(|s| !s.is_empty()))
    }
}

impl ManifestEntry {
    pub fn from_dedup(entry: &DedupEntry) -> Self {
        Self {
            id: 0,
            file_name: entry.source_name.clone(),
            file_path: entry.source_path.clone(),
            file_hash: entry.content_hash.clone(),
            file_size: entry.size,
            file_type: entry.category.as_label().to_string(),
            upload_date: entry.delivered_at.timestamp_millis(),
            upload_status: UploadStatus::Success,
            telegram_message_id: entry.remote_ref.clone(),
            error_message: None,
        }
    }

    /// `None` unless the entry records a successful delivery.
    pub fn to_dedup(&self) -> Option<DedupEntry> {
        if self.upload_status != UploadStatus::Success || self.file_hash.is_empty() {
            return None;
        }
        Some(DedupEntry {
            content_hash: self.file_hash.clone(),
            source_name: self.file_name.clone(),
            source_path: self.file_path.clone(),
            size: self.file_size,
            category: MediaCategory::from_label(&self.file_type),
            delivered_at: self.uploaded_at(),
            remote_ref: self.telegram_message_id.clone(),
        })
    }

    pub fn uploaded_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.upload_date).unwrap_or_default()
    }
}

/// Union keyed by `file_hash`; the newer `upload_date` wins and `local`
/// wins ties. Sorted newest first.
pub fn merge(local: &[ManifestEntry], remote: &[ManifestEntry]) -> Vec<ManifestEntry> {
    let mut merged: HashMap<&str, &ManifestEntry> = HashMap::new();

    for entry in remote.iter().chain(local.iter()) {
        match merged.get(entry.file_hash.as_str()) {
            Some(existing) if existing.upload_date > entry.upload_date => {}
            _ => {
                merged.insert(entry.file_hash.as_str(), entry);
            }
        }
    }

    let mut out: Vec<ManifestEntry> = merged.into_values().cloned().collect();
    out.sort_by(|a, b| {
        b.upload_date
            .cmp(&a.upload_date)
            .then_with(|| a.file_hash.cmp(&b.file_hash))
    });
    out
}

pub fn parse(json: &[u8]) -> serde_json::Result<Vec<ManifestEntry>> {
    serde_json::from_slice(json)
}

pub fn render(entries: &[ManifestEntry]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(entries)
}

/// Aggregate numbers over a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_files: usize,
    pub total_size: u64,
    pub successful_backups: usize,
    pub failed_backups: usize,
    pub file_types: BTreeMap<String, usize>,
}

impl HistoryStats {
    pub fn from_entries(entries: &[ManifestEntry]) -> Self {
        let mut stats = Self {
            total_files: entries.len(),
            ..Self::default()
        };
        for entry in entries {
            stats.total_size += entry.file_size;
            match entry.upload_status {
                UploadStatus::Success => stats.successful_backups += 1,
                UploadStatus::Failed => stats.failed_backups += 1,
                UploadStatus::Pending => {}
            }
            *stats.file_types.entry(entry.file_type.clone()).or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, date: i64) -> ManifestEntry {
        ManifestEntry {
            id: 0,
            file_name: format!("{hash}.jpg"),
            file_path: format!("/DCIM/{hash}.jpg"),
            file_hash: hash.to_string(),
            file_size: 100,
            file_type: "image".to_string(),
            upload_date: date,
            upload_status: UploadStatus::Success,
            telegram_message_id: None,
            error_message: None,
        }
    }

    #[test]
    fn test_merge_with_itself_is_identity() {
        let m = merge(&[entry("a", 3), entry("b", 1), entry("c", 2)], &[]);
        assert_eq!(merge(&m, &m), m);
    }

    #[test]
    fn test_merge_newer_wins_either_side() {
        let mut newer = entry("h1", 20);
        newer.telegram_message_id = Some("9".into());

        assert_eq!(merge(&[entry("h1", 10)], &[newer.clone()]), vec![newer.clone()]);
        assert_eq!(merge(&[newer.clone()], &[entry("h1", 10)]), vec![newer]);
    }

    #[test]
    fn test_merge_union_sorted_newest_first() {
        let merged = merge(&[entry("a", 1), entry("b", 5)], &[entry("c", 3)]);
        let hashes: Vec<&str> = merged.iter().map(|e| e.file_hash.as_str()).collect();
        assert_eq!(hashes, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_wire_format() {
        let json = r#"[{
            "id": 7,
            "fileName": "IMG_1.jpg",
            "filePath": "/DCIM/Camera/IMG_1.jpg",
            "fileHash": "abc",
            "fileSize": 1234,
            "fileType": "image",
            "uploadDate": 1700000000000,
            "uploadStatus": "success",
            "telegramMessageId": "",
            "errorMessage": ""
        }]"#;

        let entries = parse(json.as_bytes()).unwrap();
        assert_eq!(entries[0].id, 7);
        assert_eq!(entries[0].telegram_message_id, None);
        assert_eq!(entries[0].upload_status, UploadStatus::Success);

        let rendered = render(&entries).unwrap();
        assert!(rendered.contains("\"telegramMessageId\": \"\""));
        assert!(rendered.contains("\"uploadDate\": 1700000000000"));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"[{"fileName":"a.mp4","fileHash":"h","fileType":"video"}]"#;
        let entries = parse(json.as_bytes()).unwrap();
        assert_eq!(entries[0].upload_status, UploadStatus::Success);
        assert_eq!(entries[0].file_size, 0);
        assert_eq!(entries[0].error_message, None);
    }

    #[test]
    fn test_dedup_conversion_skips_failures() {
        let ok = entry("a", 1_700_000_000_000);
        let dedup = ok.to_dedup().unwrap();
        assert_eq!(dedup.content_hash, "a");
        assert_eq!(dedup.category, MediaCategory::Image);
        assert_eq!(ManifestEntry::from_dedup(&dedup), ok);

        let mut failed = entry("b", 1);
        failed.upload_status = UploadStatus::Failed;
        assert!(failed.to_dedup().is_none());
    }

    #[test]
    fn test_stats() {
        let mut failed = entry("b", 1);
        failed.upload_status = UploadStatus::Failed;
        failed.file_type = "video".into();

        let stats = HistoryStats::from_entries(&[entry("a", 1), failed]);
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_size, 200);
        assert_eq!(stats.successful_backups, 1);
        assert_eq!(stats.failed_backups, 1);
        assert_eq!(stats.file_types.get("video"), Some(&1));
    }
}
