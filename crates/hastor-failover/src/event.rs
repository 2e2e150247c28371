//! VRRP events and the FIFO line format they arrive in.

use std::fmt;
use std::str::FromStr;

use hastor_sys::VrrpState;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::FailoverError;

/// Topic every received event is published on, accepted or not.
pub const VRRP_EVENT_TOPIC: &str = "failover.vrrp_event";

/// What happened on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// The local router instance became master.
    Master,
    /// The local router instance became backup.
    Backup,
    /// The router instance is initialising.
    Init,
    /// Administrator-requested takeover.
    #[serde(rename = "FORCETAKEOVER")]
    ForceTakeover,
}

impl EventKind {
    /// Whether this kind leads to a promotion.
    pub fn is_promotion(self) -> bool {
        matches!(self, EventKind::Master | EventKind::ForceTakeover)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Master => "MASTER",
            EventKind::Backup => "BACKUP",
            EventKind::Init => "INIT",
            EventKind::ForceTakeover => "FORCETAKEOVER",
        })
    }
}

impl From<VrrpState> for EventKind {
    fn from(state: VrrpState) -> Self {
        match state {
            VrrpState::Master => EventKind::Master,
            VrrpState::Backup => EventKind::Backup,
            VrrpState::Init => EventKind::Init,
        }
    }
}

impl FromStr for EventKind {
    type Err = FailoverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FORCETAKEOVER" | "forcetakeover" => Ok(EventKind::ForceTakeover),
            other => other.parse::<VrrpState>().map(Into::into).map_err(|e| FailoverError::Parse {
                line: s.to_string(),
                reason: e.message,
            }),
        }
    }
}

/// One state change on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrrpEvent {
    /// Interface the router instance runs on.
    pub ifname: String,
    /// Virtual host id, when the instance name carries one.
    pub vhid: Option<u32>,
    /// New state.
    pub kind: EventKind,
    /// When the event was read.
    pub received_at: Instant,
}

impl VrrpEvent {
    /// An event received now.
    pub fn new(ifname: impl Into<String>, kind: EventKind) -> Self {
        Self {
            ifname: ifname.into(),
            vhid: None,
            kind,
            received_at: Instant::now(),
        }
    }
}

/// Parse one `<group> <instance> <state> <priority>` FIFO line.
///
/// The instance is `<ifname>_<vhid>`, optionally quoted. Returns `Ok(None)`
/// for blank lines and for router states that are not failover events
/// (`FAULT`, `STOP`).
pub fn parse_fifo_line(line: &str) -> Result<Option<VrrpEvent>, FailoverError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(None);
    }
    let malformed = |reason: &str| FailoverError::Parse {
        line: line.to_string(),
        reason: reason.to_string(),
    };
    let (Some(instance), Some(state)) = (tokens.get(1), tokens.get(2)) else {
        return Err(malformed("expected at least three fields"));
    };
    let instance = instance.trim_matches('"');
    let (ifname, vhid) = match instance.split_once('_') {
        Some((ifname, rest)) => (ifname, rest.parse().ok()),
        None => (instance, None),
    };
    if ifname.is_empty() {
        return Err(malformed("empty interface name"));
    }
    let kind = match state.parse::<VrrpState>() {
        Ok(s) => EventKind::from(s),
        Err(_) if matches!(*state, "FAULT" | "STOP") => return Ok(None),
        Err(_) => return Err(malformed("unknown state")),
    };
    Ok(Some(VrrpEvent {
        ifname: ifname.to_string(),
        vhid,
        kind,
        received_at: Instant::now(),
    }))
}
