//! Sentinel files: UI status markers, the takeover override, the pool
//! cache-file policy and the watchdog alert.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Every sentinel path the coordinator touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelPaths {
    /// Present while a promotion is electing.
    pub electing: PathBuf,
    /// Present while volumes are being imported.
    pub importing: PathBuf,
    /// Present after a failed promotion.
    pub failed: PathBuf,
    /// Present while this node is master.
    pub master: PathBuf,
    /// Created by an admin takeover, removed by a successful promotion.
    pub override_file: PathBuf,
    /// Present when the pool cache files must be discarded.
    pub killcache: PathBuf,
    /// Live pool cache file.
    pub zpool_cache: PathBuf,
    /// Saved copy of the pool cache file.
    pub zpool_cache_saved: PathBuf,
    /// Epoch of the last demotion that armed the watchdog.
    pub watchdog_alert: PathBuf,
}

impl Default for SentinelPaths {
    fn default() -> Self {
        Self {
            electing: PathBuf::from("/tmp/.failover_electing"),
            importing: PathBuf::from("/tmp/.failover_importing"),
            failed: PathBuf::from("/tmp/.failover_failed"),
            master: PathBuf::from("/tmp/.failover_master"),
            override_file: PathBuf::from("/tmp/failover_override"),
            killcache: PathBuf::from("/data/zfs/killcache"),
            zpool_cache: PathBuf::from("/data/zfs/zpool.cache"),
            zpool_cache_saved: PathBuf::from("/data/zfs/zpool.cache.saved"),
            watchdog_alert: PathBuf::from("/data/sentinels/.watchdog-alert"),
        }
    }
}

/// UI status marker. At most one is present at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMarker {
    /// Promotion started.
    Electing,
    /// Importing volumes.
    Importing,
    /// Promotion failed.
    Failed,
    /// This node is master.
    Master,
}

/// Outcome of [`SentinelPaths::apply_cachefile_policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// The killcache sentinel was present; both cache files were removed.
    Discarded,
    /// The killcache sentinel was created for the next boot.
    Armed,
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn create_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(path)?;
    f.write_all(data)?;
    f.sync_all()
}

impl SentinelPaths {
    /// Every path rooted under `root`, for tests and staging trees.
    pub fn under(root: &Path) -> Self {
        Self {
            electing: root.join("tmp/.failover_electing"),
            importing: root.join("tmp/.failover_importing"),
            failed: root.join("tmp/.failover_failed"),
            master: root.join("tmp/.failover_master"),
            override_file: root.join("tmp/failover_override"),
            killcache: root.join("data/zfs/killcache"),
            zpool_cache: root.join("data/zfs/zpool.cache"),
            zpool_cache_saved: root.join("data/zfs/zpool.cache.saved"),
            watchdog_alert: root.join("data/sentinels/.watchdog-alert"),
        }
    }

    fn marker_path(&self, marker: StatusMarker) -> &Path {
        match marker {
            StatusMarker::Electing => &self.electing,
            StatusMarker::Importing => &self.importing,
            StatusMarker::Failed => &self.failed,
            StatusMarker::Master => &self.master,
        }
    }

    /// Make `marker` the only status marker present; `None` clears all.
    pub fn set_marker(&self, marker: Option<StatusMarker>) -> std::io::Result<()> {
        for m in [
            StatusMarker::Electing,
            StatusMarker::Importing,
            StatusMarker::Failed,
            StatusMarker::Master,
        ] {
            if Some(m) != marker {
                remove_if_present(self.marker_path(m))?;
            }
        }
        if let Some(m) = marker {
            create_synced(self.marker_path(m), b"")?;
        }
        Ok(())
    }

    /// The status marker currently present, if any.
    pub fn marker(&self) -> Option<StatusMarker> {
        [
            StatusMarker::Master,
            StatusMarker::Failed,
            StatusMarker::Importing,
            StatusMarker::Electing,
        ]
        .into_iter()
        .find(|m| self.marker_path(*m).exists())
    }

    /// Record that the administrator requested a takeover.
    pub fn write_override(&self) -> std::io::Result<()> {
        create_synced(&self.override_file, b"")
    }

    /// Remove the takeover override.
    pub fn clear_override(&self) -> std::io::Result<()> {
        remove_if_present(&self.override_file)
    }

    /// Discard stale pool cache files or arm their removal for next boot,
    /// then refresh the saved copy if the live cache is newer.
    pub fn apply_cachefile_policy(&self) -> std::io::Result<CachePolicy> {
        let policy = if self.killcache.exists() {
            info!("killcache present, removing pool cache files");
            remove_if_present(&self.zpool_cache)?;
            remove_if_present(&self.zpool_cache_saved)?;
            CachePolicy::Discarded
        } else {
            create_synced(&self.killcache, b"")?;
            CachePolicy::Armed
        };

        if let (Ok(live), Ok(saved)) = (fs::metadata(&self.zpool_cache), fs::metadata(&self.zpool_cache_saved)) {
            if live.modified()? > saved.modified()? {
                debug!("refreshing saved pool cache file");
                fs::copy(&self.zpool_cache, &self.zpool_cache_saved)?;
            }
        }
        Ok(policy)
    }

    /// Write `epoch` as four big-endian bytes to the watchdog alert file.
    pub fn write_watchdog_alert(&self, epoch: u32) -> std::io::Result<()> {
        create_synced(&self.watchdog_alert, &epoch.to_be_bytes())
    }

    /// Epoch stored by the last demotion that did not finish, if any.
    pub fn read_watchdog_alert(&self) -> std::io::Result<Option<u32>> {
        match fs::read(&self.watchdog_alert) {
            Ok(bytes) => match <[u8; 4]>::try_from(bytes.as_slice()) {
                Ok(b) => Ok(Some(u32::from_be_bytes(b))),
                Err(_) => {
                    warn!(len = bytes.len(), "malformed watchdog alert file");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove the watchdog alert file.
    pub fn clear_watchdog_alert(&self) -> std::io::Result<()> {
        remove_if_present(&self.watchdog_alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_single_marker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SentinelPaths::under(dir.path());
        assert_eq!(paths.marker(), None);
        paths.set_marker(Some(StatusMarker::Electing)).unwrap();
        paths.set_marker(Some(StatusMarker::Importing)).unwrap();
        assert!(!paths.electing.exists());
        assert_eq!(paths.marker(), Some(StatusMarker::Importing));
        paths.set_marker(Some(StatusMarker::Master)).unwrap();
        assert_eq!(paths.marker(), Some(StatusMarker::Master));
        paths.set_marker(None).unwrap();
        assert_eq!(paths.marker(), None);
    }

    #[test]
    fn test_cachefile_policy() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SentinelPaths::under(dir.path());
        assert_eq!(paths.apply_cachefile_policy().unwrap(), CachePolicy::Armed);
        assert!(paths.killcache.exists());

        fs::write(&paths.zpool_cache, b"cache").unwrap();
        fs::write(&paths.zpool_cache_saved, b"saved").unwrap();
        assert_eq!(paths.apply_cachefile_policy().unwrap(), CachePolicy::Discarded);
        assert!(!paths.zpool_cache.exists());
        assert!(!paths.zpool_cache_saved.exists());
    }

    #[test]
    fn test_saved_cache_refreshed_when_older() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SentinelPaths::under(dir.path());
        fs::create_dir_all(paths.zpool_cache.parent().unwrap()).unwrap();
        fs::write(&paths.zpool_cache_saved, b"old").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&paths.zpool_cache_saved)
            .unwrap()
            .set_modified(old)
            .unwrap();
        fs::write(&paths.zpool_cache, b"new").unwrap();
        paths.apply_cachefile_policy().unwrap();
        assert_eq!(fs::read(&paths.zpool_cache_saved).unwrap(), b"new");
    }

    #[test]
    fn test_watchdog_alert_is_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SentinelPaths::under(dir.path());
        assert_eq!(paths.read_watchdog_alert().unwrap(), None);
        paths.write_watchdog_alert(0x0102_0304).unwrap();
        assert_eq!(fs::read(&paths.watchdog_alert).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(paths.read_watchdog_alert().unwrap(), Some(0x0102_0304));
        paths.clear_watchdog_alert().unwrap();
        paths.clear_watchdog_alert().unwrap();
        assert!(!paths.watchdog_alert.exists());
    }

    #[test]
    fn test_override_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SentinelPaths::under(dir.path());
        paths.write_override().unwrap();
        assert!(paths.override_file.exists());
        paths.clear_override().unwrap();
        assert!(!paths.override_file.exists());
    }
}
