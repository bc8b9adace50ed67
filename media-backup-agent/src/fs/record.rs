//! File records produced by a scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "heic"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "3gp"];

/// Coarse media type, decides which batch size a file is uploaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Image,
    Video,
    Other,
}

impl MediaCategory {
    /// Classify by extension, case-insensitive.
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            MediaCategory::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaCategory::Video
        } else {
            MediaCategory::Other
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(MediaCategory::Other)
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            MediaCategory::Image => "image",
            MediaCategory::Video => "video",
            MediaCategory::Other => "other",
        }
    }

    /// Unknown labels map to `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "image" => MediaCategory::Image,
            "video" => MediaCategory::Video,
            _ => MediaCategory::Other,
        }
    }

    /// Images and documents share the small-file batch; videos get their own.
    pub fn is_video_like(&self) -> bool {
        matches!(self, MediaCategory::Video)
    }
}

/// A file that qualified for upload. Identity is `content_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub content_hash: String,
    pub size: u64,
    pub category: MediaCategory,
    pub last_modified: DateTime<Utc>,
}

impl FileRecord {
    /// File name for display and remote captions
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Size and modification time of a regular file.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileStat {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .and_then(|d| DateTime::<Utc>::from_timestamp_millis(d.as_millis() as i64))
            .unwrap_or_default();

        Self {
            size: metadata.len(),
            modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_category_from_extension() {
        assert_eq!(MediaCategory::from_extension("JPG"), MediaCategory::Image);
        assert_eq!(MediaCategory::from_extension("mov"), MediaCategory::Video);
        assert_eq!(MediaCategory::from_extension("pdf"), MediaCategory::Other);
        assert_eq!(
            MediaCategory::from_path(Path::new("/x/clip.MP4")),
            MediaCategory::Video
        );
        assert_eq!(MediaCategory::from_path(Path::new("/x/noext")), MediaCategory::Other);
    }

    #[test]
    fn test_label_round_trip() {
        for category in [MediaCategory::Image, MediaCategory::Video, MediaCategory::Other] {
            assert_eq!(MediaCategory::from_label(category.as_label()), category);
        }
        assert_eq!(MediaCategory::from_label("audio"), MediaCategory::Other);
    }

    #[test]
    fn test_file_stat() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let stat = FileStat::from_path(temp_file.path())?;
        assert_eq!(stat.size, 12);
        assert!(stat.modified.timestamp() > 0);
        Ok(())
    }
}
