#![warn(missing_docs)]

//! hastor subsystem layer: external command executor, cluster lock registry,
//! shared error types and typed wrappers over the appliance services the
//! failover coordinator and directory-services engine depend on.

pub mod error;
pub mod exec;
pub mod fsutil;
pub mod lock;
pub mod secret;

pub mod ad;
pub mod fencing;
pub mod firewall;
pub mod host;
pub mod iface;
pub mod kerberos;
pub mod klist;
pub mod ldap;
pub mod peer;
pub mod pool;
pub mod secrets;
pub mod service;
pub mod watchdog;

pub mod fakes;

pub use error::{CallError, CallResult, Errno, ValidationError, ValidationErrors};
pub use exec::{CommandSpec, ExecError, ExecOutput, Runner, SystemExecutor};
pub use lock::{LockError, LockGuard, LockRegistry};
pub use fsutil::{atomic_write, JsonState};
pub use secret::SecretString;

pub use ad::{AdService, DomainInfo, NetAds};
pub use fencing::{FencedCli, Fencing, FencingMode};
pub use firewall::{Firewall, NftFirewall};
pub use host::{Host, HostCli};
pub use iface::{CarpInterfaces, Interfaces, VrrpState};
pub use kerberos::{Kerberos, KinitCredential, KinitOptions, KrbCred, MitKerberos};
pub use ldap::{Ldap, LdapBind, LdapEntry, LdapOptions, LdapScope, LdapSearchCli};
pub use peer::{HttpPeer, Peer};
pub use pool::{ImportOptions, PoolInfo, PoolService, ZpoolCli};
pub use secrets::{FileSecretsStore, SecretsStore};
pub use service::{ServiceManager, SystemdServices};
pub use watchdog::{DevWatchdog, Rebooter, SysrqRebooter, Watchdog};

/// Well-known cluster lock names.
pub mod locks {
    /// Held for the duration of a promotion.
    pub const VRRP_MASTER: &str = "vrrp_master";
    /// Held for the duration of a demotion.
    pub const VRRP_BACKUP: &str = "vrrp_backup";
    /// Held by admin mutations of the failover configuration.
    pub const FAILOVER_EVENT: &str = "failover_event";
    /// Held for one directory-services check and recover cycle.
    pub const DS_RECOVERY: &str = "ds_recovery";

    /// Per-interface event serialization lock.
    pub fn failover_ifq(ifname: &str) -> String {
        format!("failover_ifq_{}", ifname)
    }
}
