//! [`JobHost`] backed by `tokio-cron-scheduler`.

use super::{JobHost, JobKind, JobSpec, JobState};
use crate::{AgentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Executes a job by name when the host fires it.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, name: &str) -> Result<()>;
}

fn scheduler_err(e: JobSchedulerError) -> AgentError {
    AgentError::Scheduler(e.to_string())
}

pub struct CronJobHost {
    scheduler: Mutex<JobScheduler>,
    runner: OnceLock<Arc<dyn JobRunner>>,
    ids: Arc<DashMap<String, Uuid>>,
    states: Arc<DashMap<String, JobState>>,
}

impl CronJobHost {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_err)?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            runner: OnceLock::new(),
            ids: Arc::new(DashMap::new()),
            states: Arc::new(DashMap::new()),
        })
    }

    /// Attach the runner. Jobs cannot be submitted before this.
    pub fn bind(&self, runner: Arc<dyn JobRunner>) -> Result<()> {
        self.runner
            .set(runner)
            .map_err(|_| AgentError::Scheduler("job runner already bound".to_string()))
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.lock().await.start().await.map_err(scheduler_err)?;
        info!("Job scheduler started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.lock().await.shutdown().await.map_err(scheduler_err)?;
        info!("Job scheduler stopped");
        Ok(())
    }

    fn build_job(&self, spec: &JobSpec, runner: Arc<dyn JobRunner>) -> Result<Job> {
        let name = spec.name.clone();
        let kind = spec.kind;
        let ids = Arc::clone(&self.ids);
        let states = Arc::clone(&self.states);

        let run = move |job_id: Uuid, _lock: JobScheduler| {
            let name = name.clone();
            let runner = Arc::clone(&runner);
            let ids = Arc::clone(&ids);
            let states = Arc::clone(&states);
            Box::pin(async move {
                let is_current = |ids: &DashMap<String, Uuid>| {
                    ids.get(&name).map(|id| *id) == Some(job_id)
                };
                if is_current(&ids) {
                    states.insert(name.clone(), JobState::Running);
                }
                let result = runner.run_job(&name).await;
                if let Err(e) = &result {
                    error!(job = %name, "Job failed: {}", e);
                }

                let next = match (kind, result.is_ok()) {
                    (JobKind::Periodic, _) => JobState::Pending,
                    (JobKind::OneShot, true) => JobState::Succeeded,
                    (JobKind::OneShot, false) => JobState::Failed,
                };
                // Skip when the job was cancelled or replaced while running.
                if is_current(&ids) {
                    states.insert(name.clone(), next);
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        };

        let job = match spec.kind {
            JobKind::Periodic => Job::new_repeated_async(spec.interval, run),
            JobKind::OneShot => Job::new_one_shot_async(spec.interval, run),
        };
        job.map_err(scheduler_err)
    }
}

#[async_trait]
impl JobHost for CronJobHost {
    async fn submit(&self, spec: &JobSpec) -> Result<()> {
        let runner = self
            .runner
            .get()
            .cloned()
            .ok_or_else(|| AgentError::Scheduler("no job runner bound".to_string()))?;

        let job = self.build_job(spec, runner)?;
        let scheduler = self.scheduler.lock().await;

        if let Some((_, old)) = self.ids.remove(&spec.name) {
            if let Err(e) = scheduler.remove(&old).await {
                warn!(job = %spec.name, "Failed to remove previous job: {}", e);
            }
        }

        let id = scheduler.add(job).await.map_err(scheduler_err)?;
        self.ids.insert(spec.name.clone(), id);
        self.states.insert(spec.name.clone(), JobState::Pending);
        Ok(())
    }

    async fn cancel(&self, name: &str) -> Result<()> {
        self.states.remove(name);
        if let Some((_, id)) = self.ids.remove(name) {
            self.scheduler
                .lock()
                .await
                .remove(&id)
                .await
                .map_err(scheduler_err)?;
            info!(job = %name, "Job cancelled");
        }
        Ok(())
    }

    async fn state(&self, name: &str) -> JobState {
        let recorded = match self.states.get(name) {
            Some(state) => *state,
            None => return JobState::Absent,
        };

        // A pending job the scheduler no longer knows about has been lost.
        if recorded == JobState::Pending && self.next_fire(name).await.is_none() {
            return JobState::Absent;
        }
        recorded
    }

    async fn next_fire(&self, name: &str) -> Option<DateTime<Utc>> {
        let id = *self.ids.get(name)?;
        let mut scheduler = self.scheduler.lock().await;
        scheduler.next_tick_for_job(id).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelRunner(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl JobRunner for ChannelRunner {
        async fn run_job(&self, name: &str) -> Result<()> {
            let _ = self.0.send(name.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submit_requires_runner() {
        let host = CronJobHost::new().await.unwrap();
        let spec = JobSpec {
            name: "backup".into(),
            kind: JobKind::Periodic,
            interval: Duration::from_secs(3600),
        };
        assert!(host.submit(&spec).await.is_err());
        assert_eq!(host.state("backup").await, JobState::Absent);
    }

    #[tokio::test]
    async fn test_one_shot_fires_and_succeeds() {
        let host = CronJobHost::new().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        host.bind(Arc::new(ChannelRunner(tx))).unwrap();
        host.start().await.unwrap();

        host.submit(&JobSpec {
            name: "command_listener".into(),
            kind: JobKind::OneShot,
            interval: Duration::from_millis(100),
        })
        .await
        .unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired, "command_listener");

        // State is updated right after the runner returns
        let mut state = host.state("command_listener").await;
        for _ in 0..50 {
            if state == JobState::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = host.state("command_listener").await;
        }
        assert_eq!(state, JobState::Succeeded);

        host.cancel("command_listener").await.unwrap();
        assert_eq!(host.state("command_listener").await, JobState::Absent);
    }

    #[tokio::test]
    async fn test_resubmit_replaces() {
        let host = CronJobHost::new().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        host.bind(Arc::new(ChannelRunner(tx))).unwrap();

        let mut spec = JobSpec {
            name: "backup".into(),
            kind: JobKind::Periodic,
            interval: Duration::from_secs(3600),
        };
        host.submit(&spec).await.unwrap();
        let first = *host.ids.get("backup").unwrap();

        spec.interval = Duration::from_secs(7200);
        host.submit(&spec).await.unwrap();
        let second = *host.ids.get("backup").unwrap();

        assert_ne!(first, second);
        assert_eq!(host.ids.len(), 1);
    }
}
