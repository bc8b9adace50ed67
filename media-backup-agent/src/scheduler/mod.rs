//! Canonical background jobs and the watchdog that keeps them alive.
//!
//! [`PeriodicScheduler`] remembers which jobs should exist and submits them
//! to a [`JobHost`]; submitting a name that already exists replaces it. The
//! [`Watchdog`] compares that expectation with what the host reports and
//! resubmits anything that is no longer pending or running.

pub mod host;
pub mod watchdog;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use host::{CronJobHost, JobRunner};
pub use watchdog::{Watchdog, WatchdogReport};

/// Names of the jobs the agent keeps scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobName {
    Backup,
    CommandListener,
    Watchdog,
}

impl JobName {
    pub const ALL: [JobName; 3] = [JobName::Backup, JobName::CommandListener, JobName::Watchdog];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::Backup => "backup",
            JobName::CommandListener => "command_listener",
            JobName::Watchdog => "watchdog",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|j| j.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Periodic,
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Unknown to the host
    Absent,
}

impl JobState {
    pub fn is_alive(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

/// Parameters a job is (re)submitted with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub kind: JobKind,
    /// Period for periodic jobs, initial delay for one-shot jobs
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJobState {
    pub job_name: String,
    pub kind: JobKind,
    pub next_fire_hint: Option<DateTime<Utc>>,
    pub last_observed_state: JobState,
}

/// Whatever actually runs jobs in the background.
#[async_trait]
pub trait JobHost: Send + Sync {
    /// Schedule `spec`, replacing any job with the same name.
    async fn submit(&self, spec: &JobSpec) -> Result<()>;

    /// Remove the job; unknown names are ignored.
    async fn cancel(&self, name: &str) -> Result<()>;

    async fn state(&self, name: &str) -> JobState;

    async fn next_fire(&self, _name: &str) -> Option<DateTime<Utc>> {
        None
    }
}

pub struct PeriodicScheduler {
    host: Arc<dyn JobHost>,
    expected: Mutex<BTreeMap<String, JobSpec>>,
}

impl PeriodicScheduler {
    pub fn new(host: Arc<dyn JobHost>) -> Self {
        Self {
            host,
            expected: Mutex::new(BTreeMap::new()),
        }
    }

    /// Run `name` every `interval`, replacing any existing job of that name.
    pub async fn schedule_recurring(&self, name: &str, interval: Duration) -> Result<()> {
        self.schedule(JobSpec {
            name: name.to_string(),
            kind: JobKind::Periodic,
            interval,
        })
        .await
    }

    /// Run `name` once after `delay`, replacing any existing job of that name.
    pub async fn schedule_once(&self, name: &str, delay: Duration) -> Result<()> {
        self.schedule(JobSpec {
            name: name.to_string(),
            kind: JobKind::OneShot,
            interval: delay,
        })
        .await
    }

    /// The expectation is recorded even when submission fails, so the
    /// watchdog retries it on its next tick.
    async fn schedule(&self, spec: JobSpec) -> Result<()> {
        self.expected.lock().insert(spec.name.clone(), spec.clone());

        match self.host.submit(&spec).await {
            Ok(()) => {
                info!(
                    job = %spec.name,
                    "Scheduled {:?} job every {:?}",
                    spec.kind,
                    spec.interval
                );
                Ok(())
            }
            Err(e) => {
                warn!(job = %spec.name, "Failed to submit job: {}", e);
                Err(e)
            }
        }
    }

    /// Stop keeping `name` alive and remove it from the host.
    pub async fn cancel(&self, name: &str) -> Result<()> {
        self.expected.lock().remove(name);
        self.host.cancel(name).await
    }

    pub fn expected_jobs(&self) -> Vec<JobSpec> {
        self.expected.lock().values().cloned().collect()
    }

    pub fn expected(&self, name: &str) -> Option<JobSpec> {
        self.expected.lock().get(name).cloned()
    }

    pub fn host(&self) -> &Arc<dyn JobHost> {
        &self.host
    }

    /// Host-reported state of every expected job.
    pub async fn observe(&self) -> Vec<ScheduledJobState> {
        let mut out = Vec::new();
        for spec in self.expected_jobs() {
            out.push(ScheduledJobState {
                last_observed_state: self.host.state(&spec.name).await,
                next_fire_hint: self.host.next_fire(&spec.name).await,
                job_name: spec.name,
                kind: spec.kind,
            });
        }
        out
    }
}
