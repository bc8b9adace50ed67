//! Media Backup Agent - Main entry point

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use media_backup_agent::config::{keys, BackupConfig, Config};
use media_backup_agent::store::ConfigStore;
use media_backup_agent::{api, daemon, utils};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scheduled backups, the command listener and the control API
    Daemon,
    /// Run a single backup and exit
    RunOnce,
    /// Store the bot token and target chat id
    SetCredentials {
        #[arg(long)]
        token: String,
        #[arg(long)]
        chat_id: String,
        /// Token for publishing the shared history manifest
        #[arg(long)]
        github_token: Option<String>,
    },
    /// Forget every delivered file
    ClearHistory,
    /// Print the agent status as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    match args.command.unwrap_or(Command::Daemon) {
        Command::Daemon => {
            api::health::init_start_time();
            tracing::info!(
                "Starting media-backup-agent v{} on {}",
                env!("CARGO_PKG_VERSION"),
                utils::device_name()
            );
            let port = args.port.unwrap_or(config.agent.port);
            daemon::run_daemon(config, port).await?;
        }

        Command::RunOnce => {
            let components = daemon::build(&config)?;
            let report = components.engine.run_backup("cli").await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_success() {
                bail!("backup finished as {:?}", report.verdict);
            }
        }

        Command::SetCredentials {
            token,
            chat_id,
            github_token,
        } => {
            let components = daemon::build(&config)?;
            let store = components.store.as_ref();
            BackupConfig::store_credentials(store, &token, &chat_id)?;
            if let Some(github_token) = github_token {
                store.put_string(keys::GITHUB_TOKEN, github_token.trim())?;
            }
            println!("Credentials stored in {}", config.db_path().display());
        }

        Command::ClearHistory => {
            let components = daemon::build(&config)?;
            let removed = components.engine.clear_history()?;
            println!("Removed {} delivered file record(s)", removed);
        }

        Command::Status => {
            let components = daemon::build(&config)?;
            let status = components.engine.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
