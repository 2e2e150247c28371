#![warn(missing_docs)]

//! `hastord`: the controller daemon. Wires the job queue, directory
//! services health engine and failover coordinator into one core, serves
//! the admin API and the Prometheus exporter, and provides the admin CLI.

pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod metrics;

pub use api::AdminApi;
pub use client::AdminClient;
pub use config::{LogFormat, MgmtConfig, PeerConfig};
pub use crate::core::{Core, FailoverStatus, JobFilter, Services, SetHealthState};
pub use error::{MgmtError, Result};
pub use metrics::MgmtMetrics;
