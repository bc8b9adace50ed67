//! What each scheduled job does when it fires.

use crate::commands::CommandListener;
use crate::engine::BackupEngine;
use crate::scheduler::{JobName, JobRunner, PeriodicScheduler, Watchdog};
use crate::{AgentError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct AgentRuntime {
    engine: Arc<BackupEngine>,
    listener: CommandListener,
    scheduler: Arc<PeriodicScheduler>,
    watchdog: Watchdog,
}

impl AgentRuntime {
    pub fn new(
        engine: Arc<BackupEngine>,
        listener: CommandListener,
        scheduler: Arc<PeriodicScheduler>,
    ) -> Self {
        Self {
            watchdog: Watchdog::new(Arc::clone(&scheduler)),
            engine,
            listener,
            scheduler,
        }
    }

    async fn run_backup(&self) -> Result<()> {
        let report = self.engine.run_backup("schedule").await?;
        debug!("Scheduled run finished as {:?}", report.verdict);

        // Pick up interval changes made since the job was scheduled.
        let interval = self.engine.backup_config()?.interval();
        let name = JobName::Backup.as_str();
        if self.scheduler.expected(name).map(|s| s.interval) != Some(interval) {
            info!("Backup interval changed to {:?}, rescheduling", interval);
            self.scheduler.schedule_recurring(name, interval).await?;
        }
        Ok(())
    }

    async fn poll_commands(&self) -> Result<()> {
        let handled = self.listener.poll_once().await?;
        debug!("Handled {} command(s)", handled);
        Ok(())
    }
}

#[async_trait]
impl JobRunner for AgentRuntime {
    async fn run_job(&self, name: &str) -> Result<()> {
        match JobName::parse(name) {
            Some(JobName::Backup) => self.run_backup().await,
            Some(JobName::CommandListener) => self.poll_commands().await,
            Some(JobName::Watchdog) => {
                let report = self.watchdog.tick().await;
                if !report.resubmitted.is_empty() {
                    info!("Watchdog resubmitted {:?}", report.resubmitted);
                }
                Ok(())
            }
            None => Err(AgentError::Scheduler(format!("unknown job '{}'", name))),
        }
    }
}
