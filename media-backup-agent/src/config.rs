//! Configuration management for the backup agent.
//!
//! Two layers:
//! - [`Config`]: daemon settings loaded from a TOML file, every field defaulted.
//! - [`BackupConfig`]: per-run settings read from the key/value [`ConfigStore`]
//!   so a UI can change them while the daemon is running.

use crate::store::ConfigStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys understood by [`BackupConfig::load`] and the command listener.
pub mod keys {
    pub const BOT_TOKEN: &str = "bot_token";
    pub const BOT_CHAT_ID: &str = "bot_chat_id";
    pub const BATCH_SIZE_IMAGES: &str = "batch_size_images";
    pub const BATCH_SIZE_VIDEOS: &str = "batch_size_videos";
    pub const BATCH_DELAY_MS: &str = "batch_delay_ms";
    pub const INTER_FILE_DELAY_MS: &str = "inter_file_delay_ms";
    pub const FORCE_MOBILE_DATA: &str = "force_mobile_data";
    pub const INTERVAL_HOURS: &str = "interval_hours";
    pub const FILE_TYPES: &str = "file_types";
    pub const PRIORITY_FOLDERS: &str = "priority_folders";
    pub const GITHUB_TOKEN: &str = "github_token";
    pub const LISTENER_OFFSET: &str = "listener_offset";
    pub const LAST_RUN_AT: &str = "last_run_at";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory holding the SQLite database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root of the storage tree to back up
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Control API port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Bot API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Largest document the remote accepts
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Disabled unless a repository owner is set
    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default = "default_manifest_repo")]
    pub repo: String,

    #[serde(default = "default_manifest_path")]
    pub path: String,

    #[serde(default = "default_manifest_branch")]
    pub branch: String,

    #[serde(default = "default_contents_api_base")]
    pub api_base: String,

    /// Merged manifests larger than this are never published
    #[serde(default = "default_manifest_max_bytes")]
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_watchdog_minutes")]
    pub watchdog_minutes: u64,

    /// Interval between command listener polls
    #[serde(default = "default_listener_delay_secs")]
    pub listener_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/media-backup-agent")
}

fn default_storage_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn default_port() -> u16 {
    9991
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_max_payload_bytes() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_manifest_repo() -> String {
    "media-backup-history".to_string()
}

fn default_manifest_path() -> String {
    "historial_backup.json".to_string()
}

fn default_manifest_branch() -> String {
    "main".to_string()
}

fn default_contents_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_manifest_max_bytes() -> usize {
    900 * 1024
}

fn default_watchdog_minutes() -> u64 {
    15
}

fn default_listener_delay_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage_root: default_storage_root(),
            port: default_port(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            max_payload_bytes: default_max_payload_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            owner: None,
            repo: default_manifest_repo(),
            path: default_manifest_path(),
            branch: default_manifest_branch(),
            api_base: default_contents_api_base(),
            max_bytes: default_manifest_max_bytes(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            watchdog_minutes: default_watchdog_minutes(),
            listener_delay_secs: default_listener_delay_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            remote: RemoteConfig::default(),
            manifest: ManifestConfig::default(),
            schedule: ScheduleConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.agent.data_dir.join("media-backup.db")
    }
}

const DEFAULT_FILE_TYPES: &[&str] = &["jpg", "jpeg", "png", "mp4", "mov", "avi"];
const DEFAULT_PRIORITY_FOLDERS: &[&str] = &["DCIM", "Pictures"];

/// Settings for a single backup run. Loaded once at run start and never
/// mutated while the run is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub remote_token: String,
    pub remote_target_id: String,
    pub batch_size_images: usize,
    pub batch_size_videos: usize,
    pub inter_batch_delay_ms: u64,
    pub inter_file_delay_ms: u64,
    pub force_on_metered_network: bool,
    pub interval_hours: u64,
    /// Lower-case extensions without the leading dot
    pub extensions: BTreeSet<String>,
    pub priority_folders: Vec<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            remote_token: String::new(),
            remote_target_id: String::new(),
            batch_size_images: 10,
            batch_size_videos: 3,
            inter_batch_delay_ms: 2000,
            inter_file_delay_ms: 1000,
            force_on_metered_network: false,
            interval_hours: 24,
            extensions: DEFAULT_FILE_TYPES.iter().map(|s| s.to_string()).collect(),
            priority_folders: DEFAULT_PRIORITY_FOLDERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl BackupConfig {
    /// Read the run settings from the config store, falling back to defaults
    /// for every missing key.
    pub fn load(store: &dyn ConfigStore) -> Result<Self> {
        let defaults = Self::default();

        let extensions = match store.get_string_set(keys::FILE_TYPES)? {
            Some(set) if !set.is_empty() => set
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            _ => defaults.extensions,
        };

        let priority_folders = match store.get_string_set(keys::PRIORITY_FOLDERS)? {
            Some(set) if !set.is_empty() => set.into_iter().collect(),
            _ => defaults.priority_folders,
        };

        Ok(Self {
            remote_token: store.get_string(keys::BOT_TOKEN)?.unwrap_or_default(),
            remote_target_id: store.get_string(keys::BOT_CHAT_ID)?.unwrap_or_default(),
            batch_size_images: positive(store.get_int(keys::BATCH_SIZE_IMAGES)?)
                .unwrap_or(defaults.batch_size_images),
            batch_size_videos: positive(store.get_int(keys::BATCH_SIZE_VIDEOS)?)
                .unwrap_or(defaults.batch_size_videos),
            inter_batch_delay_ms: non_negative(store.get_int(keys::BATCH_DELAY_MS)?)
                .unwrap_or(defaults.inter_batch_delay_ms),
            inter_file_delay_ms: non_negative(store.get_int(keys::INTER_FILE_DELAY_MS)?)
                .unwrap_or(defaults.inter_file_delay_ms),
            force_on_metered_network: store
                .get_int(keys::FORCE_MOBILE_DATA)?
                .map(|v| v != 0)
                .unwrap_or(defaults.force_on_metered_network),
            interval_hours: positive(store.get_int(keys::INTERVAL_HOURS)?)
                .map(|v| v as u64)
                .unwrap_or(defaults.interval_hours),
            extensions,
            priority_folders,
        })
    }

    /// Persist remote credentials
    pub fn store_credentials(store: &dyn ConfigStore, token: &str, target_id: &str) -> Result<()> {
        store.put_string(keys::BOT_TOKEN, token.trim())?;
        store.put_string(keys::BOT_CHAT_ID, target_id.trim())?;
        Ok(())
    }

    /// Token and target must both be non-blank.
    pub fn is_valid(&self) -> bool {
        !self.remote_token.trim().is_empty() && !self.remote_target_id.trim().is_empty()
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn inter_file_delay(&self) -> Duration {
        Duration::from_millis(self.inter_file_delay_ms)
    }

    /// Scheduled backup interval, capped at [`MAX_INTERVAL_HOURS`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.min(MAX_INTERVAL_HOURS).saturating_mul(3600))
    }
}

/// One year
pub const MAX_INTERVAL_HOURS: u64 = 24 * 365;

fn positive(value: Option<i64>) -> Option<usize> {
    value.filter(|v| *v > 0).map(|v| v as usize)
}

fn non_negative(value: Option<i64>) -> Option<u64> {
    value.filter(|v| *v >= 0).map(|v| v as u64)
}
