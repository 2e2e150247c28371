//! Virtual-router state of network interfaces.

use crate::error::{CallError, CallResult, Errno};
use crate::exec::{execute, CommandSpec, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// VRRP state of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VrrpState {
    /// This node owns the virtual address.
    Master,
    /// The peer owns the virtual address.
    Backup,
    /// The router instance is initialising.
    Init,
}

impl std::str::FromStr for VrrpState {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MASTER" => Ok(VrrpState::Master),
            "BACKUP" => Ok(VrrpState::Backup),
            "INIT" => Ok(VrrpState::Init),
            other => Err(CallError::new(
                Errno::EINVAL,
                format!("unknown VRRP state {other:?}"),
            )),
        }
    }
}

/// Interface contract.
#[async_trait]
pub trait Interfaces: Send + Sync {
    /// Set the advertisement skew of one virtual address.
    async fn set_advskew(&self, ifname: &str, vhid: u32, value: u32) -> CallResult<()>;

    /// Virtual host ids configured on `ifname`.
    async fn list_vhids(&self, ifname: &str) -> CallResult<Vec<u32>>;

    /// Local VRRP state of `ifname`, `None` if it has no virtual address.
    async fn vrrp_state(&self, ifname: &str) -> CallResult<Option<VrrpState>>;
}

/// One `carp:` line of `ifconfig` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarpEntry {
    /// State.
    pub state: VrrpState,
    /// Virtual host id.
    pub vhid: u32,
    /// Current advertisement skew.
    pub advskew: u32,
}

/// Parse `carp: MASTER vhid 10 advbase 1 advskew 0` lines.
pub fn parse_carp(stdout: &str) -> Vec<CarpEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("carp:")?;
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            let state = tokens.first()?.parse().ok()?;
            let field = |name: &str| -> Option<u32> {
                let idx = tokens.iter().position(|t| *t == name)?;
                tokens.get(idx + 1)?.parse().ok()
            };
            Some(CarpEntry {
                state,
                vhid: field("vhid")?,
                advskew: field("advskew").unwrap_or(0),
            })
        })
        .collect()
}

/// [`Interfaces`] backed by `ifconfig`.
#[derive(Clone)]
pub struct CarpInterfaces {
    runner: Arc<dyn Runner>,
}

impl CarpInterfaces {
    /// Create a wrapper that runs commands through `runner`.
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self { runner }
    }

    async fn entries(&self, ifname: &str) -> CallResult<Vec<CarpEntry>> {
        let out = execute(self.runner.as_ref(), CommandSpec::new(["ifconfig", ifname])).await?;
        Ok(parse_carp(&out.stdout_str()))
    }
}

#[async_trait]
impl Interfaces for CarpInterfaces {
    async fn set_advskew(&self, ifname: &str, vhid: u32, value: u32) -> CallResult<()> {
        let vhid = vhid.to_string();
        let value = value.to_string();
        execute(
            self.runner.as_ref(),
            CommandSpec::new(["ifconfig", ifname, "vhid", vhid.as_str(), "advskew", value.as_str()]),
        )
        .await?;
        Ok(())
    }

    async fn list_vhids(&self, ifname: &str) -> CallResult<Vec<u32>> {
        Ok(self.entries(ifname).await?.into_iter().map(|e| e.vhid).collect())
    }

    async fn vrrp_state(&self, ifname: &str) -> CallResult<Option<VrrpState>> {
        let entries = self.entries(ifname).await?;
        // Any master vhid makes the interface master.
        if entries.iter().any(|e| e.state == VrrpState::Master) {
            return Ok(Some(VrrpState::Master));
        }
        Ok(entries.first().map(|e| e.state))
    }
}
