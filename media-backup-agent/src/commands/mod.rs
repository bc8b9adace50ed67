//! Chat commands understood by the agent.

pub mod listener;

use crate::engine::BackupEngine;
use crate::transfer::progress::format_bytes;
use crate::utils::device_name;
use std::sync::Arc;
use tracing::{info, warn};

pub use listener::CommandListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    StartBackup,
    Status,
    Stats,
    StopBackup,
    ClearHistory,
    SyncHistory,
    DeviceInfo,
}

impl Command {
    /// Parse the leading `/word` of a message.
    ///
    /// Anything after the first whitespace is ignored, as is a `@botname`
    /// suffix. Text that does not start with `/` is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let token = text.split_whitespace().next()?;
        let word = token.strip_prefix('/')?;
        let word = word.split('@').next().unwrap_or(word).to_ascii_lowercase();

        let command = match word.as_str() {
            "help" | "start" | "ayuda" => Command::Help,
            "backup" | "start_backup" | "iniciar_backup" | "backup_manual" => Command::StartBackup,
            "status" | "estado" => Command::Status,
            "stats" | "estadisticas" | "github_stats" => Command::Stats,
            "stop" | "stop_backup" | "detener_backup" => Command::StopBackup,
            "clear_history" | "limpiar_historial" => Command::ClearHistory,
            "sync" | "sync_history" | "github_sync" => Command::SyncHistory,
            "device" | "device_info" | "dispositivo" => Command::DeviceInfo,
            _ => return None,
        };
        Some(command)
    }
}

const HELP_TEXT: &str = "\
*Available commands*
/backup - start a backup now
/stop - cancel the running backup
/status - current backup state
/stats - delivery statistics
/sync - publish and merge the shared history
/clear_history - forget delivered files
/device - device information
/help - this message";

pub struct CommandDispatcher {
    engine: Arc<BackupEngine>,
}

impl CommandDispatcher {
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        Self { engine }
    }

    /// Execute `command` and return the reply text.
    pub async fn dispatch(&self, command: Command) -> String {
        info!("Dispatching {:?}", command);
        match command {
            Command::Help => HELP_TEXT.to_string(),

            Command::StartBackup => {
                if self.engine.spawn_backup("chat") {
                    "Backup started.".to_string()
                } else {
                    "A backup is already running.".to_string()
                }
            }

            Command::StopBackup => {
                if self.engine.cancel_backup() {
                    "Cancelling the running backup.".to_string()
                } else {
                    "No backup is running.".to_string()
                }
            }

            Command::Status => match self.engine.status() {
                Ok(status) => {
                    let last = status
                        .last_run_at
                        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    let mut reply = format!(
                        "*Status*\nRunning: {}\nConfigured: {}\nDelivered files: {}\nLast run: {}",
                        if status.running { "yes" } else { "no" },
                        if status.configured { "yes" } else { "no" },
                        status.delivered_files,
                        last
                    );
                    if status.running {
                        let p = &status.progress;
                        reply.push_str(&format!(
                            "\nPhase: {:?}\nProgress: {}/{} ({:.0}%), {} sent, {} failed",
                            p.phase,
                            p.files_done,
                            p.files_total,
                            p.percent_complete(),
                            p.sent,
                            p.errors
                        ));
                    }
                    reply
                }
                Err(e) => {
                    warn!("Status lookup failed: {}", e);
                    format!("Could not read status: {}", e)
                }
            },

            Command::Stats => {
                let stats = self.engine.stats().await;
                let mut reply = format!(
                    "*Statistics*\nFiles: {}\nTotal size: {}\nSucceeded: {}\nFailed: {}",
                    stats.total_files,
                    format_bytes(stats.total_size),
                    stats.successful_backups,
                    stats.failed_backups
                );
                for (kind, count) in &stats.file_types {
                    reply.push_str(&format!("\n  {}: {}", kind, count));
                }
                reply
            }

            Command::ClearHistory => match self.engine.clear_history() {
                Ok(removed) => format!("History cleared ({} record(s) removed).", removed),
                Err(e) => format!("Could not clear history: {}", e),
            },

            Command::SyncHistory => match self.engine.sync_history().await {
                Ok(summary) => format!(
                    "History synced: {} entries, {} imported.",
                    summary.entries, summary.imported
                ),
                Err(e) => format!("History sync failed: {}", e),
            },

            Command::DeviceInfo => format!(
                "*Device*\nName: {}\nOS: {} ({})\nAgent: v{}\nLast upload rate: {}/s",
                device_name(),
                std::env::consts::OS,
                std::env::consts::ARCH,
                env!("CARGO_PKG_VERSION"),
                format_bytes(self.engine.progress().bytes_per_second)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::engine_fixture;

    #[test]
    fn test_parse_leading_token_only() {
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("/STATUS now please"), Some(Command::Status));
        assert_eq!(Command::parse("/estado@my_backup_bot"), Some(Command::Status));
        assert_eq!(Command::parse("  /backup"), Some(Command::StartBackup));
        assert_eq!(Command::parse("/iniciar_backup"), Some(Command::StartBackup));

        assert_eq!(Command::parse("please show /status"), None);
        assert_eq!(Command::parse("status"), None);
        assert_eq!(Command::parse("/statusx"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let fx = engine_fixture();
        fx.engine.run_backup("manual").await.unwrap();
        let dispatcher = CommandDispatcher::new(fx.engine.clone());

        let stats = dispatcher.dispatch(Command::Stats).await;
        assert!(stats.contains("Files: 2"));

        let reply = dispatcher.dispatch(Command::ClearHistory).await;
        assert!(reply.contains("2 record(s)"));
        assert_eq!(fx.engine.status().unwrap().delivered_files, 0);
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let fx = engine_fixture();
        let dispatcher = CommandDispatcher::new(fx.engine.clone());
        assert_eq!(
            dispatcher.dispatch(Command::StopBackup).await,
            "No backup is running."
        );
        assert!(dispatcher.dispatch(Command::Status).await.contains("Last run: never"));
    }
}
