#![warn(missing_docs)]

//! hastor directory services: configuration, health checks for Active
//! Directory, IPA and plain LDAP binds, and the engine that applies
//! bounded recovery and publishes a single health record.

pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod keytab;
pub mod state;

pub use config::{AdConfig, DSConfig, DsConfiguration, DsCredential, DsType, IpaConfig, LdapConfig};
pub use engine::{HealthEngine, MAX_RECOVER_ATTEMPTS, RECOVER_RETRY_DELAY};
pub use error::{DsError, FaultReason, HealthError, Result};
pub use health::{checker_for, DsEnv, DsPaths, HealthChecker};
pub use keytab::{Keytab, KeytabEntry, KeytabError};
pub use state::{DSHealthState, DsStatus, HealthState, HEALTH_TOPIC};
