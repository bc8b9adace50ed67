//! Liveness check for the scheduled jobs.

use super::{JobState, PeriodicScheduler};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    pub resubmitted: Vec<String>,
    /// Jobs whose resubmission failed; retried on the next tick
    pub failed: Vec<String>,
}

pub struct Watchdog {
    scheduler: Arc<PeriodicScheduler>,
}

impl Watchdog {
    pub fn new(scheduler: Arc<PeriodicScheduler>) -> Self {
        Self { scheduler }
    }

    /// Resubmit every expected job that is neither pending nor running.
    /// Never fails; submission errors are logged and reported.
    pub async fn tick(&self) -> WatchdogReport {
        let mut report = WatchdogReport::default();
        let host = self.scheduler.host();

        for spec in self.scheduler.expected_jobs() {
            let state = host.state(&spec.name).await;
            if state.is_alive() {
                debug!(job = %spec.name, "Job is {:?}", state);
                continue;
            }

            if state != JobState::Absent {
                debug!(job = %spec.name, "Job finished as {:?}, re-arming", state);
            }

            match host.submit(&spec).await {
                Ok(()) => {
                    info!(job = %spec.name, "Watchdog resubmitted job (was {:?})", state);
                    report.resubmitted.push(spec.name);
                }
                Err(e) => {
                    warn!(job = %spec.name, "Watchdog could not resubmit job: {}", e);
                    report.failed.push(spec.name);
                }
            }
        }

        report
    }
}
