//! In-process fakes for the remote collaborators.

use crate::executor::history::{ManifestRemote, PublishOutcome, VersionedManifest};
use crate::executor::manifest::{self, ManifestEntry};
use crate::fs::FileRecord;
use crate::scheduler::{JobHost, JobSpec, JobState};
use crate::sink::{
    CommandSource, Delivery, DeliveryError, DocumentSink, IncomingMessage, RemoteTarget,
};
use crate::transfer::ProgressCallback;
use crate::{AgentError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

type SuccessHook = Box<dyn Fn(usize) + Send + Sync>;

/// Document sink that answers from a queue of scripted responses and
/// succeeds once the queue is empty.
pub struct FakeSink {
    responses: Mutex<VecDeque<std::result::Result<Delivery, DeliveryError>>>,
    attempts: Mutex<Vec<String>>,
    sent: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    on_success: Mutex<Option<SuccessHook>>,
    max_payload: u64,
}

impl Default for FakeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSink {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            on_success: Mutex::new(None),
            max_payload: 50 * 1024 * 1024,
        }
    }

    pub fn with_max_payload(mut self, bytes: u64) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn push_response(&self, response: std::result::Result<Delivery, DeliveryError>) {
        self.responses.lock().push_back(response);
    }

    /// Called with the running success count after every delivered file.
    pub fn on_success(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_success.lock() = Some(Box::new(hook));
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl DocumentSink for FakeSink {
    async fn send_document(
        &self,
        _target: &RemoteTarget,
        file: &FileRecord,
        progress: ProgressCallback,
    ) -> std::result::Result<Delivery, DeliveryError> {
        self.attempts.lock().push(file.file_name());
        let response = self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(Delivery {
                remote_ref: Some(format!("msg-{}", file.content_hash)),
            })
        });

        if response.is_ok() {
            progress(file.size);
            let count = {
                let mut sent = self.sent.lock();
                sent.push(file.file_name());
                sent.len()
            };
            if let Some(hook) = self.on_success.lock().as_ref() {
                hook(count);
            }
        }
        response
    }

    async fn send_message(
        &self,
        _target: &RemoteTarget,
        text: &str,
    ) -> std::result::Result<Delivery, DeliveryError> {
        self.messages.lock().push(text.to_string());
        Ok(Delivery::default())
    }

    fn max_payload_bytes(&self) -> u64 {
        self.max_payload
    }
}

/// Command source that hands out queued messages once.
#[derive(Default)]
pub struct FakeCommandSource {
    pending: Mutex<Vec<IncomingMessage>>,
    offsets: Mutex<Vec<i64>>,
}

impl FakeCommandSource {
    pub fn push(&self, update_id: i64, chat_id: &str, text: &str) {
        self.pending.lock().push(IncomingMessage {
            update_id,
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
    }

    pub fn requested_offsets(&self) -> Vec<i64> {
        self.offsets.lock().clone()
    }
}

#[async_trait]
impl CommandSource for FakeCommandSource {
    async fn fetch_updates(
        &self,
        _target: &RemoteTarget,
        offset: i64,
    ) -> std::result::Result<Vec<IncomingMessage>, DeliveryError> {
        self.offsets.lock().push(offset);
        let mut pending = self.pending.lock();
        let (ready, rest): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|m| m.update_id >= offset);
        *pending = rest;
        Ok(ready)
    }
}

/// Manifest remote holding its content in memory with a numeric version.
#[derive(Default)]
pub struct FakeManifestRemote {
    state: Mutex<Option<(Vec<ManifestEntry>, u64)>>,
    conflicts: Mutex<(usize, Option<ManifestEntry>)>,
    publishes: Mutex<usize>,
}

impl FakeManifestRemote {
    pub fn with_entries(entries: Vec<ManifestEntry>) -> Self {
        let remote = Self::default();
        *remote.state.lock() = Some((entries, 1));
        remote
    }

    /// The next `count` publishes lose a race against a writer adding `intruder`.
    pub fn inject_conflicts(&self, count: usize, intruder: ManifestEntry) {
        *self.conflicts.lock() = (count, Some(intruder));
    }

    pub fn current_entries(&self) -> Vec<ManifestEntry> {
        self.state
            .lock()
            .as_ref()
            .map(|(entries, _)| entries.clone())
            .unwrap_or_default()
    }

    pub fn publish_count(&self) -> usize {
        *self.publishes.lock()
    }
}

#[async_trait]
impl ManifestRemote for FakeManifestRemote {
    async fn fetch(&self) -> Result<Option<VersionedManifest>> {
        Ok(self.state.lock().as_ref().map(|(entries, version)| VersionedManifest {
            entries: entries.clone(),
            version: version.to_string(),
        }))
    }

    async fn publish(
        &self,
        content: &str,
        expected_version: Option<&str>,
    ) -> Result<PublishOutcome> {
        *self.publishes.lock() += 1;
        let mut state = self.state.lock();

        {
            let mut conflicts = self.conflicts.lock();
            if conflicts.0 > 0 {
                conflicts.0 -= 1;
                let intruder = conflicts.1.clone();
                let (mut entries, version) = state.take().unwrap_or((Vec::new(), 0));
                entries.extend(intruder);
                *state = Some((entries, version + 1));
                return Ok(PublishOutcome::Conflict);
            }
        }

        let current = state.as_ref().map(|(_, v)| v.to_string());
        if current.as_deref() != expected_version {
            return Ok(PublishOutcome::Conflict);
        }

        let entries = manifest::parse(content.as_bytes())?;
        let next = state.as_ref().map(|(_, v)| v + 1).unwrap_or(1);
        *state = Some((entries, next));
        Ok(PublishOutcome::Published {
            version: next.to_string(),
        })
    }
}

/// Job host that only records what it was asked to run.
#[derive(Default)]
pub struct FakeJobHost {
    jobs: Mutex<BTreeMap<String, (JobSpec, JobState)>>,
    submits: Mutex<usize>,
    fail_next: Mutex<bool>,
}

impl FakeJobHost {
    pub fn jobs(&self) -> Vec<JobSpec> {
        self.jobs.lock().values().map(|(spec, _)| spec.clone()).collect()
    }

    pub fn job(&self, name: &str) -> Option<JobSpec> {
        self.jobs.lock().get(name).map(|(spec, _)| spec.clone())
    }

    /// Drop the job as if the host had lost it.
    pub fn evict(&self, name: &str) {
        self.jobs.lock().remove(name);
    }

    pub fn set_state(&self, name: &str, state: JobState) {
        if let Some(job) = self.jobs.lock().get_mut(name) {
            job.1 = state;
        }
    }

    pub fn fail_next_submit(&self) {
        *self.fail_next.lock() = true;
    }

    pub fn submit_count(&self) -> usize {
        *self.submits.lock()
    }
}

#[async_trait]
impl JobHost for FakeJobHost {
    async fn submit(&self, spec: &JobSpec) -> Result<()> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(AgentError::Scheduler("host unavailable".to_string()));
        }
        *self.submits.lock() += 1;
        self.jobs
            .lock()
            .insert(spec.name.clone(), (spec.clone(), JobState::Pending));
        Ok(())
    }

    async fn cancel(&self, name: &str) -> Result<()> {
        self.jobs.lock().remove(name);
        Ok(())
    }

    async fn state(&self, name: &str) -> JobState {
        self.jobs
            .lock()
            .get(name)
            .map(|(_, state)| *state)
            .unwrap_or(JobState::Absent)
    }
}
