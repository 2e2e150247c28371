//! In-memory implementations of every service contract, for tests.
//!
//! Each fake records the calls it receives so tests can assert on side
//! effects (firewall changes, watchdog arms, reboots) without touching the
//! host.

mod directory;
mod network;
mod runner;
mod storage;
mod system;

pub use directory::{FakeAd, FakeKerberos, FakeLdap, FakeSecrets};
pub use network::{FakeFirewall, FakeInterfaces, FakePeer};
pub use runner::{FakeRunner, Invocation};
pub use storage::{FakeFencing, FakePools, FakeRebooter, FakeWatchdog, WatchdogEvent};
pub use system::{FakeHost, FakeServices};
