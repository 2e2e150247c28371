//! The job queue.
//!
//! Jobs are admitted by [`JobQueue::submit`], wait in FIFO order for their
//! lock, and run as tokio tasks. A single dispatcher task starts every job
//! whose lock it can take; it wakes on submission, on lock release and on a
//! periodic rescan for locks held by other processes.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use hastor_sys::{CallError, Errno, LockError, LockGuard, LockRegistry, ValidationErrors};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::File;
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{JobContext, ProgressGate};
use crate::error::{JobAborted, JobError, Result};
use crate::events::{EventBus, EventKind};
use crate::excerpt::read_excerpt;
use crate::record::{ExcInfo, JobId, JobOutcome, JobProgress, JobRecord, JobSpec, JobState};
use crate::redact::RedactionTable;
use crate::JOBS_TOPIC;

type JobFn = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, anyhow::Result<JobOutcome>> + Send>;
type FinishCallback = Box<dyn FnOnce(&JobRecord) + Send>;

/// Job queue configuration.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Directory holding per-job log files.
    pub log_dir: PathBuf,
    /// Terminated jobs kept before the oldest are discarded.
    pub max_terminated: usize,
    /// Minimum spacing of progress events for one job.
    pub progress_interval: Duration,
    /// Fallback rescan period for locks released by other processes.
    pub rescan_interval: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/log/hastor/jobs"),
            max_terminated: 1000,
            progress_interval: Duration::from_secs(1),
            rescan_interval: Duration::from_secs(1),
        }
    }
}

struct QueueState {
    next_id: JobId,
    jobs: BTreeMap<JobId, Arc<JobEntry>>,
    waiting: VecDeque<JobId>,
}

pub(crate) struct JobEntry {
    pub(crate) id: JobId,
    pub(crate) method: String,
    lock: Option<String>,
    abortable: bool,
    pub(crate) record: Mutex<JobRecord>,
    pub(crate) token: CancellationToken,
    pub(crate) shielded: Mutex<bool>,
    pub(crate) progress_gate: Mutex<ProgressGate>,
    func: Mutex<Option<JobFn>>,
    done: watch::Sender<bool>,
    // `None` once the job finished and the callbacks ran.
    on_finish: Mutex<Option<Vec<FinishCallback>>>,
    log: Mutex<Option<File>>,
}

impl JobEntry {
    fn state(&self) -> JobState {
        self.record.lock().state
    }

    fn snapshot(&self) -> JobRecord {
        self.record.lock().clone()
    }

    pub(crate) fn append_log(&self, shared: &Shared, line: &str) -> std::io::Result<()> {
        let mut log = self.log.lock();
        if log.is_none() {
            if self.state().is_terminal() {
                return Ok(());
            }
            let path = shared.config.log_dir.join(format!("{}.log", self.id));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            self.record.lock().logs_path = Some(path);
            *log = Some(file);
        }
        if let Some(file) = log.as_mut() {
            writeln!(file, "[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), line)?;
        }
        Ok(())
    }
}

enum Finish {
    Done(JobOutcome),
    Failed(anyhow::Error),
    Aborted,
}

pub(crate) struct Shared {
    pub(crate) bus: EventBus,
    pub(crate) redaction: Arc<RedactionTable>,
    pub(crate) config: JobQueueConfig,
    locks: LockRegistry,
    state: Mutex<QueueState>,
    wake: Notify,
    halted: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    fn entry(&self, id: JobId) -> Result<Arc<JobEntry>> {
        self.state
            .lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound(id))
    }

    fn publish(&self, rec: &JobRecord, kind: EventKind) {
        match serde_json::to_value(rec) {
            Ok(fields) => {
                self.bus
                    .publish(JOBS_TOPIC, kind, self.redaction.scrub_value(&fields));
            }
            Err(e) => warn!(job_id = rec.id, error = %e, "failed to serialize job record"),
        }
    }

    /// Progress event, skipped once the job terminated: the final event
    /// already carries the latest progress.
    pub(crate) fn publish_progress(&self, entry: &JobEntry) {
        let rec = entry.record.lock();
        if !rec.state.is_terminal() {
            self.publish(&rec, EventKind::Changed);
        }
    }

    fn dispatch_ready(self: &Arc<Self>) {
        if self.halted.load(Ordering::SeqCst) {
            return;
        }
        let mut ready = Vec::new();
        {
            let mut st = self.state.lock();
            let waiting = std::mem::take(&mut st.waiting);
            let mut blocked: HashSet<String> = HashSet::new();
            for id in waiting {
                let Some(entry) = st.jobs.get(&id).cloned() else {
                    continue;
                };
                if entry.state() != JobState::Waiting {
                    continue;
                }
                let guard = match &entry.lock {
                    None => Ok(None),
                    // Later jobs on a lock never overtake an earlier one.
                    Some(name) if blocked.contains(name) => {
                        st.waiting.push_back(id);
                        continue;
                    }
                    Some(name) => match self.locks.try_lock(name) {
                        Ok(guard) => Ok(Some(guard)),
                        Err(LockError::AlreadyHeld { .. }) => {
                            blocked.insert(name.clone());
                            st.waiting.push_back(id);
                            continue;
                        }
                        Err(e) => Err(e),
                    },
                };
                ready.push((entry, guard));
            }
        }
        for (entry, guard) in ready {
            match guard {
                Ok(guard) => self.start(entry, guard),
                Err(e) => self.finish(&entry, Finish::Failed(e.into()), None),
            }
        }
    }

    fn start(self: &Arc<Self>, entry: Arc<JobEntry>, guard: Option<LockGuard>) {
        let Some(func) = entry.func.lock().take() else {
            return;
        };
        if entry.token.is_cancelled() {
            self.finish(&entry, Finish::Aborted, guard);
            return;
        }
        {
            let mut rec = entry.record.lock();
            rec.state = JobState::Running;
            rec.time_started = Some(Utc::now());
            self.publish(&rec, EventKind::Changed);
        }
        debug!(job_id = entry.id, method = %entry.method, lock = ?entry.lock, "job started");
        tokio::spawn(run_job(self.clone(), entry, guard, func));
    }

    fn finish(self: &Arc<Self>, entry: &Arc<JobEntry>, finish: Finish, guard: Option<LockGuard>) {
        entry.log.lock().take();
        let logs_path = entry.record.lock().logs_path.clone();
        let excerpt = logs_path
            .as_deref()
            .map(|p| self.redaction.scrub(&read_excerpt(p)));

        let snapshot = {
            let mut rec = entry.record.lock();
            if rec.state.is_terminal() {
                return;
            }
            match finish {
                Finish::Done(JobOutcome::Completed(value)) => {
                    rec.state = JobState::Success;
                    rec.result = Some(self.redaction.redact(&entry.method, &value));
                    rec.progress.percent = Some(100);
                }
                Finish::Done(JobOutcome::Ignored(reason)) => {
                    rec.state = JobState::Ignored;
                    rec.result = Some(Value::String(self.redaction.scrub(&reason)));
                }
                Finish::Failed(err) => {
                    rec.state = JobState::Failed;
                    rec.error = Some(self.redaction.scrub(&format!("{err:#}")));
                    rec.exception = Some(self.redaction.scrub(&format!("{err:?}")));
                    let mut info = exc_info(&err);
                    info.repr = self.redaction.scrub(&info.repr);
                    info.extra = info.extra.map(|e| self.redaction.scrub_value(&e));
                    rec.exc_info = Some(info);
                }
                Finish::Aborted => {
                    rec.state = JobState::Aborted;
                }
            }
            rec.logs_excerpt = excerpt;
            rec.time_finished = Some(Utc::now());
            self.publish(&rec, EventKind::Changed);
            rec.clone()
        };
        drop(guard);
        self.gc();
        entry.done.send_replace(true);

        let callbacks = entry.on_finish.lock().take().unwrap_or_default();
        for cb in callbacks {
            cb(&snapshot);
        }
        match snapshot.state {
            JobState::Failed => warn!(
                job_id = entry.id,
                method = %entry.method,
                error = snapshot.error.as_deref().unwrap_or(""),
                "job failed"
            ),
            state => info!(job_id = entry.id, method = %entry.method, %state, "job finished"),
        }
        self.wake.notify_one();
    }

    fn gc(&self) {
        let removed: Vec<Arc<JobEntry>> = {
            let mut st = self.state.lock();
            let mut terminated: Vec<(Option<DateTime<Utc>>, JobId)> = st
                .jobs
                .iter()
                .filter_map(|(id, e)| {
                    let rec = e.record.lock();
                    rec.state.is_terminal().then(|| (rec.time_finished, *id))
                })
                .collect();
            if terminated.len() <= self.config.max_terminated {
                return;
            }
            // Oldest finish first.
            terminated.sort_unstable();
            let excess = terminated.len() - self.config.max_terminated;
            terminated
                .into_iter()
                .take(excess)
                .map(|(_, id)| id)
                .filter_map(|id| st.jobs.remove(&id))
                .collect()
        };
        for entry in removed {
            if let Some(path) = entry.record.lock().logs_path.clone() {
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(job_id = entry.id, error = %e, "failed to remove job log");
                }
            }
            self.bus
                .publish(JOBS_TOPIC, EventKind::Removed, json!({ "id": entry.id }));
        }
    }
}

fn exc_info(err: &anyhow::Error) -> ExcInfo {
    let mut info = ExcInfo {
        repr: format!("{err:?}"),
        kind: "Error".to_string(),
        errno: None,
        extra: None,
    };
    for cause in err.chain() {
        let validation = cause.downcast_ref::<ValidationErrors>().or_else(|| {
            match cause.downcast_ref::<JobError>() {
                Some(JobError::Validation(v)) => Some(v),
                _ => None,
            }
        });
        if let Some(v) = validation {
            info.kind = "VALIDATION".to_string();
            info.errno = Some(Errno::EINVAL.code());
            info.extra = Some(json!(v.triples()));
            break;
        }
        if let Some(call) = cause.downcast_ref::<CallError>() {
            info.kind = "CallError".to_string();
            info.errno = Some(call.errno.code());
            info.extra = call.extra.clone();
            break;
        }
        if let Some(lock) = cause.downcast_ref::<LockError>() {
            info.kind = "LockError".to_string();
            info.errno = Some(match lock {
                LockError::AlreadyHeld { .. } => Errno::EBUSY.code(),
                LockError::Timeout { .. } => Errno::ETIMEDOUT.code(),
                LockError::Io { .. } => Errno::EFAULT.code(),
            });
            break;
        }
    }
    info
}

async fn run_job(shared: Arc<Shared>, entry: Arc<JobEntry>, guard: Option<LockGuard>, func: JobFn) {
    let ctx = JobContext::new(shared.clone(), entry.clone());
    let token = entry.token.clone();
    let fut = AssertUnwindSafe(func(ctx)).catch_unwind();
    let finish = tokio::select! {
        biased;
        res = fut => match res {
            Ok(Ok(outcome)) => Finish::Done(outcome),
            Ok(Err(err)) if is_abort(&err) => Finish::Aborted,
            Ok(Err(err)) => Finish::Failed(err),
            Err(_) => Finish::Failed(anyhow!("job panicked")),
        },
        // Dropping the job future unwinds it at its current await point.
        _ = token.cancelled() => Finish::Aborted,
    };
    shared.finish(&entry, finish, guard);
}

fn is_abort(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| e.is::<JobAborted>() || matches!(e.downcast_ref::<JobError>(), Some(JobError::Aborted(_))))
}

async fn dispatch_loop(shared: Arc<Shared>) {
    let mut releases = shared.locks.subscribe_releases();
    loop {
        shared.dispatch_ready();
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            res = releases.changed() => {
                if res.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(shared.config.rescan_interval) => {}
        }
    }
    debug!("job dispatcher stopped");
}

/// Process-local job registry. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("log_dir", &self.shared.config.log_dir)
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl JobQueue {
    /// Create the queue and spawn its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: JobQueueConfig,
        bus: EventBus,
        locks: LockRegistry,
        redaction: Arc<RedactionTable>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;
        let shared = Arc::new(Shared {
            bus,
            redaction,
            config,
            locks,
            state: Mutex::new(QueueState {
                next_id: 1,
                jobs: BTreeMap::new(),
                waiting: VecDeque::new(),
            }),
            wake: Notify::new(),
            halted: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(dispatch_loop(shared.clone()));
        Ok(Self { shared })
    }

    /// Event bus the queue publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Redaction table applied to everything the queue reports.
    pub fn redaction(&self) -> &Arc<RedactionTable> {
        &self.shared.redaction
    }

    /// Lock registry jobs acquire their locks from.
    pub fn locks(&self) -> &LockRegistry {
        &self.shared.locks
    }

    /// Admit a job. `f` runs once the job's lock is acquired.
    pub fn submit<F, Fut, T>(&self, spec: JobSpec, f: F) -> Result<JobId>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Into<JobOutcome> + 'static,
    {
        let arguments = self.shared.redaction.redact(&spec.method, &spec.arguments);
        let func: JobFn = Box::new(move |ctx| f(ctx).map(|r| r.map(Into::into)).boxed());

        let entry = {
            let mut st = self.shared.state.lock();
            if let (Some(lock), Some(limit)) = (&spec.lock, spec.lock_queue_size) {
                let same_lock = |e: &Arc<JobEntry>| e.lock.as_deref() == Some(lock.as_str());
                let refused = if limit == 0 {
                    st.jobs
                        .values()
                        .any(|e| same_lock(e) && !e.state().is_terminal())
                } else {
                    st.waiting
                        .iter()
                        .filter_map(|id| st.jobs.get(id))
                        .filter(|e| same_lock(e))
                        .count()
                        >= limit
                };
                if refused {
                    info!(method = %spec.method, lock = %lock, "job refused, already being performed");
                    return Err(JobError::AlreadyRunning {
                        method: spec.method,
                    });
                }
            }

            let id = st.next_id;
            st.next_id += 1;
            let (done, _) = watch::channel(false);
            let entry = Arc::new(JobEntry {
                id,
                method: spec.method.clone(),
                lock: spec.lock.clone(),
                abortable: spec.abortable,
                record: Mutex::new(JobRecord {
                    id,
                    method: spec.method,
                    arguments,
                    description: spec.description,
                    lock: spec.lock,
                    abortable: spec.abortable,
                    state: JobState::Waiting,
                    progress: JobProgress::default(),
                    result: None,
                    error: None,
                    exception: None,
                    exc_info: None,
                    logs_path: None,
                    logs_excerpt: None,
                    time_created: Utc::now(),
                    time_started: None,
                    time_finished: None,
                }),
                token: CancellationToken::new(),
                shielded: Mutex::new(false),
                progress_gate: Mutex::new(ProgressGate::default()),
                func: Mutex::new(Some(func)),
                done,
                on_finish: Mutex::new(Some(Vec::new())),
                log: Mutex::new(None),
            });
            st.jobs.insert(id, entry.clone());
            st.waiting.push_back(id);
            entry
        };

        {
            let rec = entry.record.lock();
            self.shared.publish(&rec, EventKind::Added);
        }
        debug!(job_id = entry.id, method = %entry.method, "job queued");
        self.shared.wake.notify_one();
        Ok(entry.id)
    }

    /// Snapshot of a job.
    pub fn get(&self, id: JobId) -> Result<JobRecord> {
        Ok(self.shared.entry(id)?.snapshot())
    }

    /// Snapshots of every job, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let entries: Vec<Arc<JobEntry>> = self.shared.state.lock().jobs.values().cloned().collect();
        entries.iter().map(|e| e.snapshot()).collect()
    }

    /// Jobs of `method` currently in `state`.
    pub fn find(&self, method: &str, state: JobState) -> Vec<JobRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.method == method && r.state == state)
            .collect()
    }

    /// Request cancellation. A waiting job is removed without running; a
    /// running job unwinds at its next await point. Aborting a terminated
    /// job is a no-op.
    pub fn abort(&self, id: JobId) -> Result<()> {
        let entry = self.shared.entry(id)?;
        if !entry.abortable {
            return Err(JobError::NotAbortable(id));
        }
        {
            let shielded = entry.shielded.lock();
            if entry.state().is_terminal() {
                return Ok(());
            }
            if *shielded {
                return Err(JobError::NotAbortable(id));
            }
            entry.token.cancel();
        }
        info!(job_id = id, method = %entry.method, "job abort requested");
        let dequeued = {
            let mut st = self.shared.state.lock();
            let before = st.waiting.len();
            st.waiting.retain(|w| *w != id);
            st.waiting.len() != before
        };
        if dequeued {
            entry.func.lock().take();
            self.shared.finish(&entry, Finish::Aborted, None);
        }
        Ok(())
    }

    /// Wait for the job to terminate and return its record.
    pub async fn wait_record(&self, id: JobId, timeout: Option<Duration>) -> Result<JobRecord> {
        let entry = self.shared.entry(id)?;
        let mut rx = entry.done.subscribe();
        let waited = async {
            rx.wait_for(|done| *done).await.map(|_| ())
        };
        let res = match timeout {
            Some(t) => tokio::time::timeout(t, waited)
                .await
                .map_err(|_| JobError::Timeout(id))?,
            None => waited.await,
        };
        res.map_err(|_| JobError::Aborted(id))?;
        Ok(entry.snapshot())
    }

    /// Wait for the job and return its result. With `raise_on_error`, a
    /// failed or aborted job is an error; otherwise the result is `null`.
    pub async fn wait(&self, id: JobId, timeout: Option<Duration>, raise_on_error: bool) -> Result<Value> {
        let rec = self.wait_record(id, timeout).await?;
        match rec.state {
            JobState::Failed if raise_on_error => Err(JobError::Failed {
                id,
                error: rec.error.unwrap_or_default(),
                errno: rec
                    .exc_info
                    .and_then(|i| i.errno)
                    .and_then(Errno::from_code),
            }),
            JobState::Aborted if raise_on_error => Err(JobError::Aborted(id)),
            _ => Ok(rec.result.unwrap_or(Value::Null)),
        }
    }

    /// Run `cb` once the job terminates, immediately if it already has.
    pub fn set_on_finish<F>(&self, id: JobId, cb: F) -> Result<()>
    where
        F: FnOnce(&JobRecord) + Send + 'static,
    {
        let entry = self.shared.entry(id)?;
        let mut pending = entry.on_finish.lock();
        match pending.as_mut() {
            Some(callbacks) => callbacks.push(Box::new(cb)),
            None => {
                drop(pending);
                cb(&entry.snapshot());
            }
        }
        Ok(())
    }

    /// Stop starting jobs. Running jobs continue; queued ones stay queued.
    pub fn halt(&self) {
        if !self.shared.halted.swap(true, Ordering::SeqCst) {
            warn!("job queue halted");
        }
    }

    /// Whether [`JobQueue::halt`] was called.
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    /// Stop the dispatcher and abort every job not inside a shielded
    /// section.
    pub fn shutdown(&self) {
        self.halt();
        let ids: Vec<JobId> = self.shared.state.lock().jobs.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.abort(id) {
                debug!(job_id = id, error = %e, "job left running at shutdown");
            }
        }
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Subscription;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct Harness {
        queue: JobQueue,
        locks: LockRegistry,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockRegistry::new(dir.path().join("locks")).unwrap();
        let config = JobQueueConfig {
            log_dir: dir.path().join("jobs"),
            max_terminated: 1000,
            progress_interval: Duration::from_secs(1),
            rescan_interval: Duration::from_millis(50),
        };
        let queue = JobQueue::new(config, EventBus::default(), locks.clone(), Arc::new(RedactionTable::new())).unwrap();
        Harness {
            queue,
            locks,
            _dir: dir,
        }
    }

    fn states(sub: &mut Subscription, id: JobId) -> Vec<String> {
        sub.drain()
            .into_iter()
            .filter(|e| e.fields["id"] == id)
            .map(|e| e.fields["state"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_success_result_and_events() {
        let h = harness();
        let mut sub = h.queue.bus().subscribe(JOBS_TOPIC);
        let id = h
            .queue
            .submit(JobSpec::new("test.echo").arguments(json!({"x": 1})), |_ctx| async {
                Ok(json!(42))
            })
            .unwrap();
        let result = h.queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap();
        assert_eq!(result, json!(42));
        let rec = h.queue.get(id).unwrap();
        assert_eq!(rec.state, JobState::Success);
        assert_eq!(rec.progress.percent, Some(100));
        assert!(rec.time_finished.is_some());
        assert_eq!(states(&mut sub, id), vec!["WAITING", "RUNNING", "SUCCESS"]);
    }

    #[tokio::test]
    async fn test_ids_monotonic() {
        let h = harness();
        let a = h.queue.submit(JobSpec::new("a"), |_| async { Ok(()) }).unwrap();
        let b = h.queue.submit(JobSpec::new("b"), |_| async { Ok(()) }).unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_failure_call_error() {
        let h = harness();
        let id = h
            .queue
            .submit(JobSpec::new("test.fail"), |_| async {
                Err::<(), _>(CallError::new(Errno::ESERVICESTARTFAILURE, "smbd did not start").into())
            })
            .unwrap();
        let err = h.queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap_err();
        match err {
            JobError::Failed { errno, .. } => assert_eq!(errno, Some(Errno::ESERVICESTARTFAILURE)),
            other => panic!("unexpected {other:?}"),
        }
        let rec = h.queue.get(id).unwrap();
        assert_eq!(rec.state, JobState::Failed);
        let info = rec.exc_info.unwrap();
        assert_eq!(info.kind, "CallError");
        assert_eq!(info.errno, Some(202));
    }

    #[tokio::test]
    async fn test_failure_validation() {
        let h = harness();
        let id = h
            .queue
            .submit(JobSpec::new("test.validate"), |_| async {
                let mut errors = ValidationErrors::new();
                errors.add("failover.timeout", "must be positive");
                errors.check()?;
                Ok(())
            })
            .unwrap();
        let value = h.queue.wait(id, Some(Duration::from_secs(5)), false).await.unwrap();
        assert_eq!(value, Value::Null);
        let info = h.queue.get(id).unwrap().exc_info.unwrap();
        assert_eq!(info.kind, "VALIDATION");
        assert_eq!(info.extra.unwrap()[0][0], "failover.timeout");
    }

    #[tokio::test]
    async fn test_ignored_outcome() {
        let h = harness();
        let id = h
            .queue
            .submit(JobSpec::new("test.ignore"), |_| async {
                Ok(JobOutcome::Ignored("already master".into()))
            })
            .unwrap();
        let rec = h.queue.wait_record(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(rec.state, JobState::Ignored);
        assert_eq!(rec.result, Some(json!("already master")));
    }

    #[tokio::test]
    async fn test_lock_fifo_and_exclusion() {
        let h = harness();
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for i in 0..4 {
            let order = order.clone();
            let running = running.clone();
            let id = h
                .queue
                .submit(JobSpec::new("test.locked").lock("L"), move |_| async move {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    order.lock().push(i);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            ids.push(id);
        }
        for id in ids {
            h.queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert!(!h.locks.is_locked("L"));
    }

    #[tokio::test]
    async fn test_lock_queue_size_zero_refuses() {
        let h = harness();
        let gate = Arc::new(Notify::new());
        let g = gate.clone();
        let first = h
            .queue
            .submit(JobSpec::new("ds.recover").lock("ds_recovery").lock_queue_size(0), move |_| async move {
                g.notified().await;
                Ok(())
            })
            .unwrap();
        let err = h
            .queue
            .submit(JobSpec::new("ds.recover").lock("ds_recovery").lock_queue_size(0), |_| async { Ok(()) })
            .unwrap_err();
        assert_eq!(err.to_string(), "This job is already being performed");
        gate.notify_one();
        h.queue.wait(first, Some(Duration::from_secs(5)), true).await.unwrap();
        // Admitted again once the first one is done.
        let again = h
            .queue
            .submit(JobSpec::new("ds.recover").lock("ds_recovery").lock_queue_size(0), |_| async { Ok(()) })
            .unwrap();
        h.queue.wait(again, Some(Duration::from_secs(5)), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_queue_size_bounds_waiting() {
        let h = harness();
        let _held = h.locks.try_lock("Q").unwrap();
        let spec = || JobSpec::new("q").lock("Q").lock_queue_size(2);
        h.queue.submit(spec(), |_| async { Ok(()) }).unwrap();
        h.queue.submit(spec(), |_| async { Ok(()) }).unwrap();
        assert!(matches!(
            h.queue.submit(spec(), |_| async { Ok(()) }),
            Err(JobError::AlreadyRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_waiting_job_never_runs() {
        let h = harness();
        let held = h.locks.try_lock("W").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let id = h
            .queue
            .submit(JobSpec::new("w").lock("W"), move |_| async move {
                r.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        h.queue.abort(id).unwrap();
        drop(held);
        let rec = h.queue.wait_record(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(rec.state, JobState::Aborted);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abort_running_releases_lock() {
        let h = harness();
        let id = h
            .queue
            .submit(JobSpec::new("long").lock("R"), |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .unwrap();
        while h.queue.get(id).unwrap().state != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.queue.abort(id).unwrap();
        let err = h.queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap_err();
        assert!(matches!(err, JobError::Aborted(_)));
        assert!(!h.locks.is_locked("R"));
    }

    #[tokio::test]
    async fn test_shielded_job_refuses_abort() {
        let h = harness();
        let gate = Arc::new(Notify::new());
        let g = gate.clone();
        let id = h
            .queue
            .submit(JobSpec::new("shielded"), move |ctx| async move {
                ctx.shield()?;
                g.notified().await;
                Ok(json!("done"))
            })
            .unwrap();
        while h.queue.get(id).unwrap().state != JobState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(h.queue.abort(id), Err(JobError::NotAbortable(_))));
        gate.notify_one();
        assert_eq!(h.queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_not_abortable() {
        let h = harness();
        let id = h
            .queue
            .submit(JobSpec::new("fixed").not_abortable(), |_| async { Ok(()) })
            .unwrap();
        assert!(matches!(h.queue.abort(id), Err(JobError::NotAbortable(_))));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let h = harness();
        let id = h
            .queue
            .submit(JobSpec::new("slow"), |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            h.queue.wait(id, Some(Duration::from_millis(20)), true).await,
            Err(JobError::Timeout(_))
        ));
        h.queue.abort(id).unwrap();
    }

    #[tokio::test]
    async fn test_on_finish_before_and_after() {
        let h = harness();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = h.queue.submit(JobSpec::new("cb"), |_| async { Ok(()) }).unwrap();
        let c = hits.clone();
        h.queue
            .set_on_finish(id, move |rec| {
                assert!(rec.state.is_terminal());
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        h.queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap();
        let c = hits.clone();
        h.queue
            .set_on_finish(id, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_halt_stops_dispatch() {
        let h = harness();
        h.queue.halt();
        let id = h.queue.submit(JobSpec::new("late"), |_| async { Ok(()) }).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.queue.get(id).unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_progress_coalesced() {
        let h = harness();
        let mut sub = h.queue.bus().subscribe(JOBS_TOPIC);
        let id = h
            .queue
            .submit(JobSpec::new("progress"), |ctx| async move {
                for p in 1..=50u8 {
                    ctx.set_progress(Some(p), Some("working"));
                }
                tokio::time::sleep(Duration::from_millis(1200)).await;
                Ok(())
            })
            .unwrap();
        h.queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap();
        let running: Vec<Value> = sub
            .drain()
            .into_iter()
            .filter(|e| e.fields["state"] == "RUNNING")
            .map(|e| e.fields["progress"]["percent"].clone())
            .collect();
        // Start event, first update, then the trailing latest value.
        assert_eq!(running, vec![Value::Null, json!(1), json!(50)]);
    }

    #[tokio::test]
    async fn test_log_excerpt_and_redaction() {
        let h = harness();
        let id = h
            .queue
            .submit(
                JobSpec::new("ds.join").arguments(json!({"username": "admin", "password": "Sup3rSecret"})),
                |ctx| async move {
                    for i in 0..25 {
                        crate::job_log!(ctx, info, "step {}", i);
                    }
                    ctx.log("binding with Sup3rSecret");
                    Err::<(), _>(anyhow!("kinit failed for admin using Sup3rSecret"))
                },
            )
            .unwrap();
        let rec = h.queue.wait_record(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(rec.arguments["password"], hastor_sys::secret::REDACTED);
        let rendered = serde_json::to_string(&rec).unwrap();
        assert!(!rendered.contains("Sup3rSecret"));
        let excerpt = rec.logs_excerpt.unwrap();
        assert!(excerpt.contains("... 6 more lines ..."));
        let log = std::fs::read_to_string(rec.logs_path.unwrap()).unwrap();
        assert!(!log.contains("Sup3rSecret"));
    }

    #[tokio::test]
    async fn test_gc_discards_oldest_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockRegistry::new(dir.path().join("locks")).unwrap();
        let config = JobQueueConfig {
            log_dir: dir.path().join("jobs"),
            max_terminated: 3,
            ..JobQueueConfig::default()
        };
        let queue = JobQueue::new(config, EventBus::default(), locks, Arc::new(RedactionTable::new())).unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = queue.submit(JobSpec::new("gc"), |_| async { Ok(()) }).unwrap();
            queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap();
            ids.push(id);
        }
        assert!(matches!(queue.get(ids[0]), Err(JobError::NotFound(_))));
        assert!(matches!(queue.get(ids[1]), Err(JobError::NotFound(_))));
        assert_eq!(queue.list().len(), 3);
    }

    #[tokio::test]
    async fn test_gc_keeps_recently_finished() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockRegistry::new(dir.path().join("locks")).unwrap();
        let config = JobQueueConfig {
            log_dir: dir.path().join("jobs"),
            max_terminated: 2,
            ..JobQueueConfig::default()
        };
        let queue = JobQueue::new(config, EventBus::default(), locks, Arc::new(RedactionTable::new())).unwrap();
        let slow = queue
            .submit(JobSpec::new("slow"), |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .unwrap();
        let mut quick = Vec::new();
        for _ in 0..2 {
            let id = queue.submit(JobSpec::new("quick"), |_| async { Ok(()) }).unwrap();
            queue.wait(id, Some(Duration::from_secs(5)), true).await.unwrap();
            quick.push(id);
        }
        queue.wait(slow, Some(Duration::from_secs(5)), true).await.unwrap();
        assert!(queue.get(slow).is_ok());
        assert!(matches!(queue.get(quick[0]), Err(JobError::NotFound(_))));
        assert!(queue.get(quick[1]).is_ok());
    }

    #[tokio::test]
    async fn test_panic_is_failure() {
        let h = harness();
        let id = h
            .queue
            .submit(JobSpec::new("panics").lock("P"), |_| async {
                if true {
                    panic!("bad");
                }
                Ok(())
            })
            .unwrap();
        let rec = h.queue.wait_record(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(rec.state, JobState::Failed);
        assert!(!h.locks.is_locked("P"));
    }
}
