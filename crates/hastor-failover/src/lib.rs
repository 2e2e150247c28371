#![warn(missing_docs)]

//! hastor failover: the VRRP event coordinator that promotes this
//! controller to MASTER or demotes it to BACKUP, with its configuration,
//! FIFO reader, sentinel files and controller state machine.

pub mod config;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod event;
pub mod fifo;
pub mod pipeline;
pub mod sentinel;
pub mod state;

mod backup;
mod master;

pub use config::{FailoverConfig, Volume, DEFAULT_GRACE_TIMEOUT_SEC};
pub use coordinator::{EventOutcome, FailoverCoordinator, FailoverStats};
pub use env::{FailoverEnv, ServicePlan, Timings};
pub use error::{FailoverError, Result};
pub use event::{parse_fifo_line, EventKind, VrrpEvent, VRRP_EVENT_TOPIC};
pub use fifo::{read_events, FifoReader};
pub use master::fencing_advskew;
pub use pipeline::{Action, Decision, BACKUP_METHOD, MASTER_METHOD};
pub use sentinel::{CachePolicy, SentinelPaths, StatusMarker};
pub use state::{ControllerState, ControllerStateMachine, StateChange, STATUS_TOPIC};
