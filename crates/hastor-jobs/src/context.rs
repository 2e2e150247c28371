//! Handle given to a running job.

use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

use crate::error::JobAborted;
use crate::queue::{JobEntry, Shared};
use crate::record::{JobId, JobProgress};

/// Progress event rate limiter state.
#[derive(Debug, Default)]
pub(crate) struct ProgressGate {
    last_emit: Option<Instant>,
    trailing: bool,
}

/// A running job's view of itself: identity, cancellation, progress and
/// the per-job log. Cheap to clone.
#[derive(Clone)]
pub struct JobContext {
    shared: Arc<Shared>,
    entry: Arc<JobEntry>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.entry.id)
            .field("method", &self.entry.method)
            .finish()
    }
}

impl JobContext {
    pub(crate) fn new(shared: Arc<Shared>, entry: Arc<JobEntry>) -> Self {
        Self { shared, entry }
    }

    /// Job id.
    pub fn id(&self) -> JobId {
        self.entry.id
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.entry.method
    }

    /// Whether an abort was requested.
    pub fn is_cancelled(&self) -> bool {
        self.entry.token.is_cancelled()
    }

    /// Resolves when an abort is requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.entry.token.cancelled()
    }

    /// Token cancelled on abort, for handing to spawned helpers.
    pub fn token(&self) -> CancellationToken {
        self.entry.token.clone()
    }

    /// `Err(JobAborted)` once an abort was requested.
    pub fn check_cancelled(&self) -> Result<(), JobAborted> {
        if self.is_cancelled() {
            Err(JobAborted)
        } else {
            Ok(())
        }
    }

    /// Enter a section that must run to completion. Abort requests are
    /// refused from here on. Fails if an abort already arrived.
    pub fn shield(&self) -> Result<(), JobAborted> {
        let mut shielded = self.entry.shielded.lock();
        if self.entry.token.is_cancelled() {
            return Err(JobAborted);
        }
        *shielded = true;
        Ok(())
    }

    /// Update progress. `None` keeps the previous value. Events are only
    /// emitted when something changed and at most once per progress
    /// interval, with the latest value delivered at the end of the interval.
    pub fn set_progress(&self, percent: Option<u8>, description: Option<&str>) {
        self.update_progress(percent, description, None);
    }

    /// Attach extra progress data.
    pub fn set_progress_extra(&self, extra: Value) {
        self.update_progress(None, None, Some(extra));
    }

    fn update_progress(&self, percent: Option<u8>, description: Option<&str>, extra: Option<Value>) {
        let changed = {
            let mut rec = self.entry.record.lock();
            if rec.state.is_terminal() {
                return;
            }
            let before = rec.progress.clone();
            let JobProgress {
                percent: p,
                description: d,
                extra: e,
            } = &mut rec.progress;
            if let Some(percent) = percent {
                *p = Some(percent.min(100));
            }
            if let Some(description) = description {
                *d = Some(self.shared.redaction.scrub(description));
            }
            if let Some(extra) = extra {
                *e = Some(extra);
            }
            rec.progress != before
        };
        if changed {
            self.schedule_progress_event();
        }
    }

    fn schedule_progress_event(&self) {
        let interval = self.shared.config.progress_interval;
        let now = Instant::now();
        let mut gate = self.entry.progress_gate.lock();
        match gate.last_emit {
            Some(last) if now < last + interval => {
                if gate.trailing {
                    return;
                }
                gate.trailing = true;
                let due = last + interval;
                let shared = self.shared.clone();
                let entry = self.entry.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(due).await;
                    {
                        let mut gate = entry.progress_gate.lock();
                        gate.trailing = false;
                        gate.last_emit = Some(Instant::now());
                    }
                    shared.publish_progress(&entry);
                });
            }
            _ => {
                gate.last_emit = Some(now);
                drop(gate);
                self.shared.publish_progress(&self.entry);
            }
        }
    }

    /// Append a line to the job log. Known secrets are scrubbed.
    pub fn log(&self, line: &str) {
        let line = self.shared.redaction.scrub(line);
        if let Err(e) = self.entry.append_log(&self.shared, &line) {
            warn!(job_id = self.entry.id, error = %e, "failed to write job log");
        }
    }

    /// Scrub known secrets from `text`.
    pub fn scrub(&self, text: &str) -> String {
        self.shared.redaction.scrub(text)
    }

    /// Register `secret` so it is scrubbed from everything this process
    /// reports.
    pub fn remember_secret(&self, secret: &str) {
        self.shared.redaction.remember(secret);
    }
}
