//! Two-phase directory scanning for backup candidates.
//!
//! Phase [`ScanPhase::Priority`] walks only the configured priority folders
//! (camera roll, pictures) so the most valuable files go out first; phase
//! [`ScanPhase::Full`] walks the whole storage root. Files already in the
//! dedup index are never yielded.

use super::hashing::{content_hash, fallback_identity};
use super::record::{FileRecord, FileStat, MediaCategory};
use crate::config::BackupConfig;
use crate::dedup::DedupIndex;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Priority,
    Full,
}

/// Rule that removes a path from the scan.
///
/// Path fragments are matched case-insensitively against the path relative
/// to the scan root, written with a leading `/` (and a trailing `/` for
/// directories), so `"/cache/"` matches any directory named `cache`.
#[derive(Clone)]
pub enum Exclusion {
    /// Files and directories whose name starts with a dot
    HiddenFiles,
    PathContains(String),
    Custom(Arc<dyn Fn(&Path) -> bool + Send + Sync>),
}

impl fmt::Debug for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::HiddenFiles => write!(f, "HiddenFiles"),
            Exclusion::PathContains(fragment) => write!(f, "PathContains({fragment:?})"),
            Exclusion::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Exclusion {
    fn matches(&self, name: &str, relative: &str, path: &Path) -> bool {
        match self {
            Exclusion::HiddenFiles => name.starts_with('.'),
            Exclusion::PathContains(fragment) => relative.contains(fragment.as_str()),
            Exclusion::Custom(predicate) => predicate(path),
        }
    }
}

/// Hidden files, temp and cache paths, thumbnail caches, file-manager
/// trash and app-private directories.
pub fn default_exclusions() -> Vec<Exclusion> {
    let mut exclusions = vec![Exclusion::HiddenFiles];
    exclusions.extend(
        [
            "/.estrongs/",
            "/.thumbnails/",
            "/temp/",
            "/tmp/",
            "/cache/",
            "/android/data/",
            "/android/obb/",
        ]
        .iter()
        .map(|fragment| Exclusion::PathContains(fragment.to_string())),
    );
    exclusions
}

/// Options for a scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Lower-case extensions without the dot
    pub extensions: BTreeSet<String>,

    /// Folder names under the root walked in the priority phase
    pub priority_folders: Vec<String>,

    pub exclusions: Vec<Exclusion>,

    /// Follow symbolic links
    pub follow_links: bool,
}

impl ScanOptions {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
            priority_folders: config.priority_folders.clone(),
            exclusions: default_exclusions(),
            follow_links: false,
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_config(&BackupConfig::default())
    }
}

/// Walks a storage root and yields files that still need delivering.
#[derive(Debug, Clone)]
pub struct FileScanner {
    root: PathBuf,
    options: ScanOptions,
    hasher: fn(&Path) -> std::io::Result<String>,
}

impl FileScanner {
    pub fn new(root: impl Into<PathBuf>, options: ScanOptions) -> Self {
        Self {
            root: root.into(),
            options,
            hasher: content_hash,
        }
    }

    #[cfg(test)]
    fn with_hasher(mut self, hasher: fn(&Path) -> std::io::Result<String>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily yield qualifying files in walk order.
    ///
    /// Re-invoking starts a fresh walk. Never mutates `index`.
    pub fn candidates<'a>(
        &'a self,
        phase: ScanPhase,
        index: &'a DedupIndex,
    ) -> impl Iterator<Item = FileRecord> + 'a {
        self.phase_roots(phase).into_iter().flat_map(move |start| {
            WalkDir::new(start)
                .follow_links(self.options.follow_links)
                .into_iter()
                .filter_entry(move |entry| !self.is_pruned_dir(entry))
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Skipping unreadable path during scan: {}", e);
                        None
                    }
                })
                .filter_map(move |entry| self.qualify(&entry, index))
        })
    }

    /// Collect candidates, newest first, one record per content hash.
    pub fn scan(&self, phase: ScanPhase, index: &DedupIndex) -> Vec<FileRecord> {
        let mut files: Vec<FileRecord> = self.candidates(phase, index).collect();
        files.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

        let mut seen = HashSet::new();
        files.retain(|f| seen.insert(f.content_hash.clone()));

        debug!(
            "Scan {:?} of {} found {} candidate(s)",
            phase,
            self.root.display(),
            files.len()
        );
        files
    }

    fn phase_roots(&self, phase: ScanPhase) -> Vec<PathBuf> {
        match phase {
            ScanPhase::Full => vec![self.root.clone()],
            ScanPhase::Priority => self
                .options
                .priority_folders
                .iter()
                .map(|folder| self.root.join(folder))
                .filter(|dir| {
                    let exists = dir.is_dir();
                    if !exists {
                        debug!("Priority folder not present: {}", dir.display());
                    }
                    exists
                })
                .collect(),
        }
    }

    fn relative_key(&self, path: &Path, is_dir: bool) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let mut key = format!("/{}", rel.to_string_lossy().replace('\\', "/"));
        if is_dir {
            key.push('/');
        }
        key.to_lowercase()
    }

    fn is_excluded(&self, entry: &DirEntry, is_dir: bool) -> bool {
        let name = entry.file_name().to_string_lossy();
        let relative = self.relative_key(entry.path(), is_dir);
        self.options
            .exclusions
            .iter()
            .any(|rule| rule.matches(&name, &relative, entry.path()))
    }

    fn is_pruned_dir(&self, entry: &DirEntry) -> bool {
        // Walk starting points are never pruned.
        entry.depth() > 0 && entry.file_type().is_dir() && self.is_excluded(entry, true)
    }

    fn qualify(&self, entry: &DirEntry, index: &DedupIndex) -> Option<FileRecord> {
        if !entry.file_type().is_file() {
            return None;
        }

        let path = entry.path();
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if !self.options.extensions.contains(&ext) {
            return None;
        }

        if self.is_excluded(entry, false) {
            debug!("Excluded: {}", path.display());
            return None;
        }

        let stat = match entry.metadata() {
            Ok(metadata) => FileStat::from_metadata(&metadata),
            Err(e) => {
                debug!("Cannot stat {}: {}", path.display(), e);
                return None;
            }
        };
        if stat.size == 0 {
            return None;
        }

        let content_hash = match (self.hasher)(path) {
            Ok(hash) => hash,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                debug!("Unreadable, skipping: {}", path.display());
                return None;
            }
            Err(e) => {
                warn!(
                    "Hashing failed for {}, using path identity: {}",
                    path.display(),
                    e
                );
                fallback_identity(path, stat.modified)
            }
        };

        if index.contains(&content_hash) {
            return None;
        }

        Some(FileRecord {
            path: path.to_path_buf(),
            content_hash,
            size: stat.size,
            category: MediaCategory::from_path(path),
            last_modified: stat.modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupEntry;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn set_mtime(path: &Path, secs_after_epoch: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .unwrap();
    }

    fn empty_index() -> DedupIndex {
        DedupIndex::open(Arc::new(MemoryStore::new())).unwrap()
    }

    fn names(files: &[FileRecord]) -> Vec<String> {
        files.iter().map(|f| f.file_name()).collect()
    }

    #[test]
    fn test_hash_read_failure_uses_path_identity() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "DCIM/a.jpg", b"truncated");

        let index = empty_index();
        let scanner = FileScanner::new(root, ScanOptions::default()).with_hasher(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "short read",
            ))
        });
        let files = scanner.scan(ScanPhase::Full, &index);

        assert_eq!(names(&files), vec!["a.jpg"]);
        let file = &files[0];
        assert_eq!(
            file.content_hash,
            fallback_identity(&file.path, file.last_modified)
        );

        // Permission errors still skip the file
        let denied = FileScanner::new(root, ScanOptions::default()).with_hasher(|_| {
            Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        });
        assert!(denied.scan(ScanPhase::Full, &index).is_empty());
    }

    #[test]
    fn test_priority_phase_only_walks_priority_folders() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "DCIM/Camera/a.jpg", b"a");
        write(root, "Pictures/b.png", b"b");
        write(root, "Download/c.jpg", b"c");

        let scanner = FileScanner::new(root, ScanOptions::default());
        let index = empty_index();

        let mut priority = names(&scanner.scan(ScanPhase::Priority, &index));
        priority.sort();
        assert_eq!(priority, vec!["a.jpg", "b.png"]);

        assert_eq!(scanner.scan(ScanPhase::Full, &index).len(), 3);
    }

    #[test]
    fn test_filters_extension_size_and_exclusions() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "DCIM/keep.JPG", b"upper-case extension");
        write(root, "DCIM/empty.jpg", b"");
        write(root, "DCIM/notes.txt", b"wrong type");
        write(root, "DCIM/.hidden.jpg", b"hidden");
        write(root, "Pictures/.thumbnails/t.jpg", b"thumb");
        write(root, "Android/data/com.app/img.jpg", b"private");
        write(root, "cache/x.jpg", b"cache");
        write(root, "Temp/y.mp4", b"temp");

        let scanner = FileScanner::new(root, ScanOptions::default());
        let files = scanner.scan(ScanPhase::Full, &empty_index());

        assert_eq!(names(&files), vec!["keep.JPG"]);
        assert_eq!(files[0].category, MediaCategory::Image);
    }

    #[test]
    fn test_newest_first_ordering() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let old = write(root, "DCIM/old.jpg", b"old");
        let new = write(root, "DCIM/new.jpg", b"new");
        let mid = write(root, "DCIM/mid.mp4", b"mid");
        set_mtime(&old, 1_000);
        set_mtime(&mid, 2_000);
        set_mtime(&new, 3_000);

        let scanner = FileScanner::new(root, ScanOptions::default());
        let files = scanner.scan(ScanPhase::Priority, &empty_index());

        assert_eq!(names(&files), vec!["new.jpg", "mid.mp4", "old.jpg"]);
    }

    #[test]
    fn test_indexed_files_never_yielded() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "DCIM/a.jpg", b"first");
        write(root, "DCIM/b.jpg", b"second");

        let scanner = FileScanner::new(root, ScanOptions::default());
        let index = empty_index();
        let first = scanner.scan(ScanPhase::Full, &index);
        assert_eq!(first.len(), 2);

        for file in &first {
            index.add(DedupEntry::delivered(file, None, Utc::now())).unwrap();
        }

        assert!(scanner.scan(ScanPhase::Full, &index).is_empty());
        assert!(scanner.scan(ScanPhase::Priority, &index).is_empty());
    }

    #[test]
    fn test_duplicate_content_yielded_once() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "DCIM/a.jpg", b"same bytes");
        write(root, "Download/copy.jpg", b"same bytes");

        let scanner = FileScanner::new(root, ScanOptions::default());
        assert_eq!(scanner.scan(ScanPhase::Full, &empty_index()).len(), 1);
    }

    #[test]
    fn test_custom_exclusion() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "DCIM/skip-me.jpg", b"x");
        write(root, "DCIM/keep.jpg", b"y");

        let mut options = ScanOptions::default();
        options.exclusions.push(Exclusion::Custom(Arc::new(|p: &Path| {
            p.to_string_lossy().contains("skip-me")
        })));

        let scanner = FileScanner::new(root, options);
        assert_eq!(
            names(&scanner.scan(ScanPhase::Full, &empty_index())),
            vec!["keep.jpg"]
        );
    }

    #[test]
    fn test_missing_priority_folders() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "Music/a.jpg", b"a");

        let scanner = FileScanner::new(temp_dir.path(), ScanOptions::default());
        assert!(scanner.scan(ScanPhase::Priority, &empty_index()).is_empty());
    }
}
