use crate::error::{CallError, CallResult, Errno};
use crate::firewall::Firewall;
use crate::iface::{Interfaces, VrrpState};
use crate::peer::Peer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct IfaceState {
    states: HashMap<String, VrrpState>,
    vhids: HashMap<String, Vec<u32>>,
    advskews: Vec<(String, u32, u32)>,
}

/// In-memory [`Interfaces`].
#[derive(Debug, Default)]
pub struct FakeInterfaces {
    state: Mutex<IfaceState>,
}

impl FakeInterfaces {
    /// No interfaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure `ifname` with a VRRP state and virtual host ids.
    pub fn set(&self, ifname: &str, state: VrrpState, vhids: &[u32]) {
        let mut st = self.state.lock();
        st.states.insert(ifname.to_string(), state);
        st.vhids.insert(ifname.to_string(), vhids.to_vec());
    }

    /// Change only the state of `ifname`.
    pub fn set_state(&self, ifname: &str, state: VrrpState) {
        self.state.lock().states.insert(ifname.to_string(), state);
    }

    /// Recorded `(ifname, vhid, advskew)` writes.
    pub fn advskews(&self) -> Vec<(String, u32, u32)> {
        self.state.lock().advskews.clone()
    }
}

#[async_trait]
impl Interfaces for FakeInterfaces {
    async fn set_advskew(&self, ifname: &str, vhid: u32, value: u32) -> CallResult<()> {
        self.state
            .lock()
            .advskews
            .push((ifname.to_string(), vhid, value));
        Ok(())
    }

    async fn list_vhids(&self, ifname: &str) -> CallResult<Vec<u32>> {
        Ok(self
            .state
            .lock()
            .vhids
            .get(ifname)
            .cloned()
            .unwrap_or_default())
    }

    async fn vrrp_state(&self, ifname: &str) -> CallResult<Option<VrrpState>> {
        Ok(self.state.lock().states.get(ifname).copied())
    }
}

/// In-memory [`Firewall`] counting each call.
#[derive(Debug, Default)]
pub struct FakeFirewall {
    accepts: AtomicUsize,
    drops: AtomicUsize,
    calls: Mutex<Vec<String>>,
    allowed: Mutex<Vec<String>>,
}

impl FakeFirewall {
    /// No calls yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `accept_all` calls.
    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Number of `drop_all` calls.
    pub fn drop_count(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    /// Calls in order: `accept_all` or `drop_all`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Interfaces exempted by the last `drop_all`.
    pub fn allowed(&self) -> Vec<String> {
        self.allowed.lock().clone()
    }
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn accept_all(&self) -> CallResult<()> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push("accept_all".to_string());
        Ok(())
    }

    async fn drop_all(&self, allowed_ifaces: &[String]) -> CallResult<()> {
        self.drops.fetch_add(1, Ordering::SeqCst);
        *self.allowed.lock() = allowed_ifaces.to_vec();
        self.calls.lock().push("drop_all".to_string());
        Ok(())
    }
}

/// In-memory [`Peer`].
#[derive(Debug, Default)]
pub struct FakePeer {
    master: AtomicBool,
    unreachable: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakePeer {
    /// A reachable peer that is not master.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set what the peer reports from `is_master`.
    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::SeqCst);
    }

    /// Make every call fail with `EREMOTENODEERROR`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Recorded calls.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn call(&self, name: &str) -> CallResult<()> {
        self.calls.lock().push(name.to_string());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CallError::new(Errno::EREMOTENODEERROR, "peer unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Peer for FakePeer {
    async fn is_master(&self) -> CallResult<bool> {
        self.call("is_master")?;
        Ok(self.master.load(Ordering::SeqCst))
    }

    async fn refresh_status(&self) -> CallResult<()> {
        self.call("refresh_status")
    }

    async fn sync_keys(&self) -> CallResult<()> {
        self.call("sync_keys")
    }
}
