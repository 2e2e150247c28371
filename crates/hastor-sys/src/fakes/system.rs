use crate::error::{CallError, CallResult, Errno};
use crate::host::Host;
use crate::service::ServiceManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Default)]
struct ServicesState {
    running: HashSet<String>,
    enabled: HashSet<String>,
    start_failures: HashMap<String, String>,
    restart_delays: HashMap<String, Duration>,
    calls: Vec<String>,
}

/// In-memory [`ServiceManager`].
#[derive(Debug, Default)]
pub struct FakeServices {
    state: Mutex<ServicesState>,
}

impl FakeServices {
    /// Nothing running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `name` running or stopped.
    pub fn set_running(&self, name: &str, running: bool) {
        let mut st = self.state.lock();
        if running {
            st.running.insert(name.to_string());
        } else {
            st.running.remove(name);
        }
    }

    /// Mark `name` enabled by the administrator.
    pub fn set_enabled(&self, name: &str, enabled: bool) {
        let mut st = self.state.lock();
        if enabled {
            st.enabled.insert(name.to_string());
        } else {
            st.enabled.remove(name);
        }
    }

    /// Make starting or restarting `name` fail with `reason`.
    pub fn fail_start(&self, name: &str, reason: &str) {
        self.state
            .lock()
            .start_failures
            .insert(name.to_string(), reason.to_string());
    }

    /// Make restarting `name` take `delay`.
    pub fn delay_restart(&self, name: &str, delay: Duration) {
        self.state
            .lock()
            .restart_delays
            .insert(name.to_string(), delay);
    }

    /// Whether `name` is running.
    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().running.contains(name)
    }

    /// Recorded calls such as `restart cifs` or `start winbindd`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Recorded calls for one verb.
    pub fn calls_for(&self, verb: &str) -> Vec<String> {
        let prefix = format!("{verb} ");
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn start(&self, name: &str, silent: bool) -> CallResult<bool> {
        let mut st = self.state.lock();
        st.calls.push(format!("start {name}"));
        if let Some(reason) = st.start_failures.get(name) {
            if silent {
                return Ok(false);
            }
            return Err(CallError::new(
                Errno::ESERVICESTARTFAILURE,
                format!("{name} failed to start: {reason}"),
            ));
        }
        st.running.insert(name.to_string());
        Ok(true)
    }

    async fn stop(&self, name: &str) -> CallResult<()> {
        let mut st = self.state.lock();
        st.calls.push(format!("stop {name}"));
        st.running.remove(name);
        Ok(())
    }

    async fn restart(&self, name: &str, timeout: Duration) -> CallResult<()> {
        let delay = {
            let mut st = self.state.lock();
            st.calls.push(format!("restart {name}"));
            st.restart_delays.get(name).copied()
        };
        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(CallError::new(
                    Errno::ETIMEDOUT,
                    format!("{name} restart timed out"),
                ));
            }
            tokio::time::sleep(delay).await;
        }
        let mut st = self.state.lock();
        if let Some(reason) = st.start_failures.get(name) {
            return Err(CallError::new(
                Errno::ESERVICESTARTFAILURE,
                format!("{name} failed to restart: {reason}"),
            ));
        }
        st.running.insert(name.to_string());
        Ok(())
    }

    async fn reload(&self, name: &str) -> CallResult<()> {
        self.state.lock().calls.push(format!("reload {name}"));
        Ok(())
    }

    async fn started(&self, name: &str) -> CallResult<bool> {
        Ok(self.is_running(name))
    }

    async fn enabled(&self, name: &str) -> CallResult<bool> {
        Ok(self.state.lock().enabled.contains(name))
    }
}

/// In-memory [`Host`].
#[derive(Debug, Default)]
pub struct FakeHost {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashSet<String>>,
}

impl FakeHost {
    /// Every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the operation recorded as `call` fail, e.g. `sync_dns` or
    /// `etc_generate krb5`.
    pub fn fail(&self, call: &str) {
        self.failures.lock().insert(call.to_string());
    }

    /// Recorded calls.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of times `call` was recorded.
    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    fn call(&self, call: String) -> CallResult<()> {
        let failed = self.failures.lock().contains(&call);
        self.calls.lock().push(call.clone());
        if failed {
            return Err(CallError::new(Errno::EFAULT, format!("{call} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn etc_generate(&self, group: &str) -> CallResult<()> {
        self.call(format!("etc_generate {group}"))
    }

    async fn sync_dns(&self) -> CallResult<()> {
        self.call("sync_dns".to_string())
    }

    async fn sed_unlock_all(&self) -> CallResult<()> {
        self.call("sed_unlock_all".to_string())
    }

    async fn start_vms(&self) -> CallResult<()> {
        self.call("start_vms".to_string())
    }

    async fn fill_account_cache(&self) -> CallResult<()> {
        self.call("fill_account_cache".to_string())
    }
}
