#![warn(missing_docs)]

//! hastor test & validation.
//!
//! Cross-crate scenario suites for failover and directory services, and
//! property suites for the invariants the controller must keep under
//! arbitrary event sequences. Everything runs a full daemon core over the
//! in-memory fakes of `hastor_sys::fakes`.

pub mod harness;
pub mod proptest_failover;
pub mod proptest_health;
pub mod proptest_redaction;

mod health_tests;

pub use harness::{ad_config, Appliance, Fakes, AD_PRINCIPAL};
