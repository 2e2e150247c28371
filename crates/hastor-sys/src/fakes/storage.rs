use crate::error::{CallError, CallResult, Errno};
use crate::fencing::{Fencing, FencingMode};
use crate::pool::{ImportOptions, PoolInfo, PoolService};
use crate::watchdog::{Rebooter, Watchdog};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct PoolsState {
    pools: Vec<PoolInfo>,
    import_errors: HashMap<String, CallError>,
    stale_cache: HashSet<String>,
    export_delays: HashMap<String, Duration>,
    export_errors: HashMap<String, CallError>,
    locked: HashSet<String>,
    calls: Vec<String>,
}

/// In-memory [`PoolService`]. Known pools carry status `OFFLINE` while
/// exported and `ONLINE` once imported.
#[derive(Debug, Default)]
pub struct FakePools {
    state: Mutex<PoolsState>,
}

impl FakePools {
    /// No pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool.
    pub fn add_pool(&self, name: &str, guid: &str, status: &str) {
        self.state.lock().pools.push(PoolInfo {
            name: name.to_string(),
            guid: guid.to_string(),
            status: status.to_string(),
        });
    }

    /// Make importing `guid` fail.
    pub fn fail_import(&self, guid: &str, err: CallError) {
        self.state.lock().import_errors.insert(guid.to_string(), err);
    }

    /// Make importing `guid` with a cache file fail with `ENOENT`.
    pub fn stale_cachefile(&self, guid: &str) {
        self.state.lock().stale_cache.insert(guid.to_string());
    }

    /// Make exporting `name` take `delay`.
    pub fn delay_export(&self, name: &str, delay: Duration) {
        self.state.lock().export_delays.insert(name.to_string(), delay);
    }

    /// Make exporting `name` fail.
    pub fn fail_export(&self, name: &str, err: CallError) {
        self.state.lock().export_errors.insert(name.to_string(), err);
    }

    /// Make unlocking the datasets of `name` fail.
    pub fn fail_unlock(&self, name: &str) {
        self.state.lock().locked.insert(name.to_string());
    }

    /// Current record of `name`, imported or not.
    pub fn pool(&self, name: &str) -> Option<PoolInfo> {
        self.state.lock().pools.iter().find(|p| p.name == name).cloned()
    }

    /// Recorded calls, e.g. `import 0xAB cachefile=/data/zfs/zpool.cache`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl PoolService for FakePools {
    async fn list(&self) -> CallResult<Vec<PoolInfo>> {
        Ok(self
            .state
            .lock()
            .pools
            .iter()
            .filter(|p| p.is_imported())
            .cloned()
            .collect())
    }

    async fn import_by_guid(&self, guid: &str, opts: &ImportOptions) -> CallResult<()> {
        let mut st = self.state.lock();
        let cache = opts
            .cachefile
            .as_ref()
            .map(|c| c.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        st.calls.push(format!("import {} cachefile={}", guid, cache));
        if opts.cachefile.is_some() && st.stale_cache.contains(guid) {
            return Err(CallError::new(Errno::ENOENT, "cannot open cache file"));
        }
        if let Some(err) = st.import_errors.get(guid) {
            return Err(err.clone());
        }
        match st.pools.iter_mut().find(|p| p.guid == guid) {
            Some(pool) => {
                pool.status = "ONLINE".to_string();
                Ok(())
            }
            None => Err(CallError::new(Errno::ENOENT, format!("no such pool {guid}"))),
        }
    }

    async fn export(&self, name: &str, force: bool) -> CallResult<()> {
        let delay = {
            let mut st = self.state.lock();
            st.calls
                .push(format!("export {}{}", name, if force { " force" } else { "" }));
            st.export_delays.get(name).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.state.lock();
        if let Some(err) = st.export_errors.get(name) {
            return Err(err.clone());
        }
        match st.pools.iter_mut().find(|p| p.name == name) {
            Some(pool) => {
                pool.status = "OFFLINE".to_string();
                Ok(())
            }
            None => Err(CallError::new(Errno::ENOENT, format!("no such pool {name}"))),
        }
    }

    async fn status(&self, name: &str) -> CallResult<Option<PoolInfo>> {
        Ok(self.pool(name).filter(|p| p.is_imported()))
    }

    async fn unlock_datasets(&self, name: &str) -> CallResult<()> {
        let mut st = self.state.lock();
        st.calls.push(format!("unlock {}", name));
        if st.locked.contains(name) {
            return Err(CallError::new(
                Errno::EDATASETISLOCKED,
                format!("{name}: key load failed"),
            ));
        }
        Ok(())
    }
}

/// In-memory [`Fencing`] that returns scripted start codes.
#[derive(Debug, Default)]
pub struct FakeFencing {
    codes: Mutex<VecDeque<i32>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFencing {
    /// Every start returns 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue start codes; once exhausted, starts return 0.
    pub fn script(&self, codes: &[i32]) {
        self.codes.lock().extend(codes.iter().copied());
    }

    /// Recorded calls: `start NORMAL`, `start FORCE`, `stop`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Fencing for FakeFencing {
    async fn start(&self, mode: FencingMode) -> CallResult<i32> {
        let label = match mode {
            FencingMode::Normal => "start NORMAL",
            FencingMode::Force => "start FORCE",
        };
        self.calls.lock().push(label.to_string());
        Ok(self.codes.lock().pop_front().unwrap_or(0))
    }

    async fn stop(&self) -> CallResult<()> {
        self.calls.lock().push("stop".to_string());
        Ok(())
    }
}

/// One recorded watchdog operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// `arm(seconds)` at the given instant.
    Arm {
        /// Requested timeout.
        seconds: u32,
        /// When it was armed.
        at: Instant,
    },
    /// `disarm()` at the given instant.
    Disarm {
        /// When it was disarmed.
        at: Instant,
    },
}

/// In-memory [`Watchdog`] that keeps a log of arms and disarms.
#[derive(Debug, Default)]
pub struct FakeWatchdog {
    log: Mutex<Vec<WatchdogEvent>>,
}

impl FakeWatchdog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// The full log.
    pub fn log(&self) -> Vec<WatchdogEvent> {
        self.log.lock().clone()
    }

    /// Timeouts of every arm call.
    pub fn arms(&self) -> Vec<u32> {
        self.log
            .lock()
            .iter()
            .filter_map(|e| match e {
                WatchdogEvent::Arm { seconds, .. } => Some(*seconds),
                WatchdogEvent::Disarm { .. } => None,
            })
            .collect()
    }

    /// Whether the last operation was an arm.
    pub fn is_armed(&self) -> bool {
        matches!(self.log.lock().last(), Some(WatchdogEvent::Arm { .. }))
    }
}

#[async_trait]
impl Watchdog for FakeWatchdog {
    async fn arm(&self, seconds: u32) -> CallResult<()> {
        self.log.lock().push(WatchdogEvent::Arm {
            seconds,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn disarm(&self) -> CallResult<()> {
        self.log
            .lock()
            .push(WatchdogEvent::Disarm { at: Instant::now() });
        Ok(())
    }
}

/// [`Rebooter`] that only counts.
#[derive(Debug, Default)]
pub struct FakeRebooter {
    count: AtomicUsize,
    at: Mutex<Option<Instant>>,
    notify: Notify,
}

impl FakeRebooter {
    /// Not yet rebooted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reboot requests.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// When the first reboot was requested.
    pub fn rebooted_at(&self) -> Option<Instant> {
        *self.at.lock()
    }

    /// Wait until a reboot has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() > 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Rebooter for FakeRebooter {
    fn reboot(&self) -> CallResult<()> {
        self.at.lock().get_or_insert_with(Instant::now);
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_import_export_cycle() {
        let pools = FakePools::new();
        pools.add_pool("tank", "0xAB", "OFFLINE");
        assert!(pools.list().await.unwrap().is_empty());
        pools
            .import_by_guid("0xAB", &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(pools.pool("tank").unwrap().status, "ONLINE");
        pools.export("tank", true).await.unwrap();
        assert_eq!(pools.pool("tank").unwrap().status, "OFFLINE");
        assert_eq!(pools.calls(), vec!["import 0xAB cachefile=none", "export tank force"]);
    }

    #[tokio::test]
    async fn test_fencing_script() {
        let fencing = FakeFencing::new();
        fencing.script(&[2, 1]);
        assert_eq!(fencing.start(FencingMode::Normal).await.unwrap(), 2);
        assert_eq!(fencing.start(FencingMode::Normal).await.unwrap(), 1);
        assert_eq!(fencing.start(FencingMode::Force).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rebooter_wait() {
        let rebooter = std::sync::Arc::new(FakeRebooter::new());
        let r = rebooter.clone();
        let waiter = tokio::spawn(async move { r.wait().await });
        tokio::task::yield_now().await;
        rebooter.reboot().unwrap();
        waiter.await.unwrap();
        assert_eq!(rebooter.count(), 1);
    }
}
