#![warn(missing_docs)]

//! hastor job subsystem: a process-local registry of long-running tasks
//! with progress, cancellation, wait and event broadcast, plus the event bus
//! and the secret redaction table every broadcast goes through.

pub mod context;
pub mod error;
pub mod events;
pub mod excerpt;
pub mod queue;
pub mod record;
pub mod redact;

pub use context::JobContext;
pub use error::{JobAborted, JobError, Result};
pub use events::{BusEvent, EventBus, EventError, EventKind, Subscription};
pub use queue::{JobQueue, JobQueueConfig};
pub use record::{ExcInfo, JobId, JobOutcome, JobProgress, JobRecord, JobSpec, JobState};
pub use redact::RedactionTable;

/// Topic carrying job `ADDED` and `CHANGED` events.
pub const JOBS_TOPIC: &str = "core.get_jobs";

/// Log a line to both `tracing` and the job's own log file.
///
/// ```ignore
/// job_log!(ctx, info, "importing pool {}", name);
/// ```
#[macro_export]
macro_rules! job_log {
    ($ctx:expr, $lvl:ident, $($arg:tt)+) => {{
        let ctx: &$crate::JobContext = &$ctx;
        let msg = format!($($arg)+);
        let msg = ctx.scrub(&msg);
        tracing::$lvl!(job_id = ctx.id(), method = %ctx.method(), "{}", msg);
        ctx.log(&msg);
    }};
}
