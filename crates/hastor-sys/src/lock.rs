//! Named cluster locks.
//!
//! Each name maps to a FIFO-fair async mutex for waiters inside this process
//! and to a pid file published with an atomic `link(2)` for exclusion across
//! processes.
//! A pid file left behind by a crashed holder is reclaimed once its pid is
//! no longer alive.

use dashmap::DashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{CallError, Errno};

const FILE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock registry errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Fail-fast acquisition found the lock held.
    #[error("lock {name} is already held")]
    AlreadyHeld {
        /// Lock name.
        name: String,
        /// Pid recorded in the lock file, when known.
        holder: Option<u32>,
    },

    /// The lock was not acquired within the timeout.
    #[error("timed out after {waited:?} waiting for lock {name}")]
    Timeout {
        /// Lock name.
        name: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The backing file could not be created or read.
    #[error("lock file I/O error for {name}: {source}")]
    Io {
        /// Lock name.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

impl From<LockError> for CallError {
    fn from(err: LockError) -> Self {
        let errno = match &err {
            LockError::AlreadyHeld { .. } => Errno::EBUSY,
            LockError::Timeout { .. } => Errno::ETIMEDOUT,
            LockError::Io { .. } => Errno::EFAULT,
        };
        CallError::new(errno, err.to_string())
    }
}

/// Holds a named lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    path: PathBuf,
    released: Arc<watch::Sender<u64>>,
    _permit: OwnedMutexGuard<()>,
}

impl LockGuard {
    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match read_pid(&self.path) {
            Some(pid) if pid != std::process::id() => {
                warn!(lock = %self.name, holder = pid, "lock file no longer ours, leaving it");
            }
            _ => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(lock = %self.name, error = %e, "failed to remove lock file");
                    }
                }
            }
        }
        debug!(lock = %self.name, "lock released");
        self.released.send_modify(|gen| *gen = gen.wrapping_add(1));
    }
}

/// Registry of named locks backed by pid files in one directory.
#[derive(Debug, Clone)]
pub struct LockRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    released: Arc<watch::Sender<u64>>,
    scratch: AtomicU64,
}

impl LockRegistry {
    /// Create a registry whose lock files live under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (tx, _rx) = watch::channel(0u64);
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                locks: DashMap::new(),
                released: Arc::new(tx),
                scratch: AtomicU64::new(0),
            }),
        })
    }

    /// Directory holding the lock files.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// A receiver whose value changes every time any lock is released.
    pub fn subscribe_releases(&self) -> watch::Receiver<u64> {
        self.inner.released.subscribe()
    }

    fn mutex(&self, name: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.inner.dir.join(format!("{}.lock", file))
    }

    /// Acquire `name`.
    ///
    /// `Some(Duration::ZERO)` fails fast with [`LockError::AlreadyHeld`],
    /// `None` queues behind earlier waiters until the holder releases, and
    /// any other duration bounds the wait.
    pub async fn with_lock(&self, name: &str, timeout: Option<Duration>) -> Result<LockGuard> {
        if timeout == Some(Duration::ZERO) {
            return self.try_lock(name);
        }
        let start = Instant::now();
        let mutex = self.mutex(name);
        let permit = match timeout {
            None => mutex.lock_owned().await,
            Some(limit) => tokio::time::timeout(limit, mutex.lock_owned())
                .await
                .map_err(|_| LockError::Timeout {
                    name: name.to_string(),
                    waited: start.elapsed(),
                })?,
        };
        let deadline = timeout.map(|t| start + t);
        loop {
            match self.create_file(name)? {
                FileClaim::Acquired => return Ok(self.guard(name, permit)),
                FileClaim::Held(holder) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(LockError::Timeout {
                                name: name.to_string(),
                                waited: start.elapsed(),
                            });
                        }
                    }
                    debug!(lock = name, ?holder, "lock file held by another process, waiting");
                    tokio::time::sleep(FILE_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Acquire `name` without waiting.
    pub fn try_lock(&self, name: &str) -> Result<LockGuard> {
        let permit = self
            .mutex(name)
            .try_lock_owned()
            .map_err(|_| LockError::AlreadyHeld {
                name: name.to_string(),
                holder: Some(std::process::id()),
            })?;
        match self.create_file(name)? {
            FileClaim::Acquired => Ok(self.guard(name, permit)),
            FileClaim::Held(holder) => Err(LockError::AlreadyHeld {
                name: name.to_string(),
                holder,
            }),
        }
    }

    /// Whether `name` is currently held by this process.
    pub fn is_locked(&self, name: &str) -> bool {
        match self.inner.locks.get(name) {
            Some(m) => m.try_lock().is_err(),
            None => false,
        }
    }

    fn guard(&self, name: &str, permit: OwnedMutexGuard<()>) -> LockGuard {
        debug!(lock = name, "lock acquired");
        LockGuard {
            name: name.to_string(),
            path: self.path_for(name),
            released: self.inner.released.clone(),
            _permit: permit,
        }
    }

    /// Publish our pid file. The pid is written to a private temp file
    /// first and hard-linked into place, so the lock file is never seen
    /// without its pid.
    fn create_file(&self, name: &str) -> Result<FileClaim> {
        let path = self.path_for(name);
        let io = |source| LockError::Io {
            name: name.to_string(),
            source,
        };
        let tmp = self.scratch_path(&path, "tmp");
        {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)
                .map_err(io)?;
            writeln!(f, "{}", std::process::id()).map_err(io)?;
            f.sync_all().map_err(io)?;
        }
        let claim = self.link_file(name, &path, &tmp);
        if let Err(e) = std::fs::remove_file(&tmp) {
            warn!(lock = name, error = %e, "failed to remove lock temp file");
        }
        claim
    }

    fn link_file(&self, name: &str, path: &Path, tmp: &Path) -> Result<FileClaim> {
        let io = |source| LockError::Io {
            name: name.to_string(),
            source,
        };
        loop {
            match std::fs::hard_link(tmp, path) {
                Ok(()) => return Ok(FileClaim::Acquired),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io(e)),
            }
            let holder = read_pid(path);
            match holder {
                // The in-process mutex is held by us, so a file with our own
                // pid is a leaked guard.
                Some(pid) if pid != std::process::id() && pid_alive(pid) => {
                    return Ok(FileClaim::Held(Some(pid)));
                }
                Some(_) => {}
                None => match file_age(path) {
                    None => continue,
                    Some(age) if age < UNREADABLE_GRACE => return Ok(FileClaim::Held(None)),
                    Some(_) => {}
                },
            }
            if let Some(live) = self.reclaim(name, path, holder)? {
                return Ok(FileClaim::Held(Some(live)));
            }
        }
    }

    /// Move a stale lock file aside. If the file moved aside turned out to
    /// belong to a live holder that replaced the stale one, it is linked
    /// back and that holder's pid is returned.
    fn reclaim(&self, name: &str, path: &Path, stale: Option<u32>) -> Result<Option<u32>> {
        let io = |source| LockError::Io {
            name: name.to_string(),
            source,
        };
        let grave = self.scratch_path(path, "stale");
        match std::fs::rename(path, &grave) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io(e)),
        }
        let live = read_pid(&grave)
            .filter(|pid| Some(*pid) != stale && *pid != std::process::id() && pid_alive(*pid));
        match live {
            None => info!(lock = name, stale_pid = ?stale, "reclaimed stale lock file"),
            Some(pid) => {
                if let Err(e) = std::fs::hard_link(&grave, path) {
                    warn!(lock = name, holder = pid, error = %e, "failed to restore live lock file");
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&grave) {
            warn!(lock = name, error = %e, "failed to remove reclaimed lock file");
        }
        Ok(live)
    }

    fn scratch_path(&self, path: &Path, suffix: &str) -> PathBuf {
        let seq = self.inner.scratch.fetch_add(1, Ordering::Relaxed);
        let file = path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default();
        self.inner
            .dir
            .join(format!(".{}.{}.{}.{}", file, std::process::id(), seq, suffix))
    }
}

/// Outcome of trying to publish a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileClaim {
    Acquired,
    /// Another process holds the file; its pid when readable.
    Held(Option<u32>),
}

/// A lock file without a readable pid is only reclaimed once it is older
/// than this, so a foreign writer that creates then writes is not robbed.
const UNREADABLE_GRACE: Duration = Duration::from_secs(2);

/// Age of the file at `path`, or `None` if it is gone.
fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(modified.elapsed().unwrap_or_default())
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> (tempfile::TempDir, LockRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = LockRegistry::new(dir.path().join("locks")).unwrap();
        (dir, reg)
    }

    #[tokio::test]
    async fn test_lock_file_lifecycle() {
        let (_dir, reg) = registry();
        let guard = reg.with_lock("vrrp_master", None).await.unwrap();
        let path = reg.dir().join("vrrp_master.lock");
        let pid: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
        assert!(reg.is_locked("vrrp_master"));
        drop(guard);
        assert!(!path.exists());
        assert!(!reg.is_locked("vrrp_master"));
    }

    #[tokio::test]
    async fn test_fail_fast_when_held() {
        let (_dir, reg) = registry();
        let _guard = reg.with_lock("vrrp_backup", None).await.unwrap();
        let err = reg
            .with_lock("vrrp_backup", Some(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { .. }));
        let call: CallError = err.into();
        assert_eq!(call.errno, Errno::EBUSY);
    }

    #[tokio::test]
    async fn test_timeout_when_held() {
        let (_dir, reg) = registry();
        let _guard = reg.with_lock("ds_recovery", None).await.unwrap();
        let err = reg
            .with_lock("ds_recovery", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_distinct_names_independent() {
        let (_dir, reg) = registry();
        let _a = reg.with_lock("failover_ifq_eth0", None).await.unwrap();
        let _b = reg.with_lock("failover_ifq_eth1", Some(Duration::ZERO)).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let (_dir, reg) = registry();
        let guard = reg.with_lock("failover_event", None).await.unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let reg = reg.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _g = reg.with_lock("failover_event", None).await.unwrap();
                order.lock().push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(guard);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let (_dir, reg) = registry();
        let inside = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            let inside = inside.clone();
            let max = max.clone();
            handles.push(tokio::spawn(async move {
                let _g = reg.with_lock("vrrp_master", None).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_file_from_dead_pid_is_reclaimed() {
        let (_dir, reg) = registry();
        // Reap a short-lived child to obtain a pid that is no longer alive.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        std::fs::write(reg.dir().join("vrrp_master.lock"), format!("{}\n", dead)).unwrap();
        let guard = reg.with_lock("vrrp_master", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(guard.name(), "vrrp_master");
    }

    #[tokio::test]
    async fn test_file_held_by_live_process() {
        let (_dir, reg) = registry();
        // pid 1 is always alive.
        std::fs::write(reg.dir().join("vrrp_master.lock"), "1\n").unwrap();
        let err = reg.try_lock("vrrp_master").unwrap_err();
        match err {
            LockError::AlreadyHeld { holder, .. } => assert_eq!(holder, Some(1)),
            other => panic!("unexpected: {other}"),
        }
        let err = reg
            .with_lock("vrrp_master", Some(Duration::from_millis(120)))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_fresh_empty_file_is_not_reclaimed() {
        let (_dir, reg) = registry();
        // A writer that has created the file but not yet written its pid.
        std::fs::File::create(reg.dir().join("ds_recovery.lock")).unwrap();
        let err = reg.try_lock("ds_recovery").unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { holder: None, .. }));
        assert!(reg.dir().join("ds_recovery.lock").exists());
    }

    #[tokio::test]
    async fn test_old_empty_file_is_reclaimed() {
        let (_dir, reg) = registry();
        let path = reg.dir().join("ds_recovery.lock");
        let f = std::fs::File::create(&path).unwrap();
        f.set_modified(std::time::SystemTime::now() - Duration::from_secs(60)).unwrap();
        drop(f);
        let guard = reg.try_lock("ds_recovery").unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_lock_file_always_carries_pid() {
        let (_dir, reg) = registry();
        let _guard = reg.with_lock("vrrp_master", None).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(reg.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["vrrp_master.lock".to_string()]);
    }

    #[tokio::test]
    async fn test_guard_leaves_foreign_file() {
        let (_dir, reg) = registry();
        let path = reg.dir().join("vrrp_master.lock");
        let guard = reg.with_lock("vrrp_master", None).await.unwrap();
        std::fs::write(&path, "1\n").unwrap();
        drop(guard);
        assert_eq!(read_pid(&path), Some(1));
    }

    #[tokio::test]
    async fn test_release_notifies_subscribers() {
        let (_dir, reg) = registry();
        let mut rx = reg.subscribe_releases();
        let g = reg.with_lock("vrrp_master", None).await.unwrap();
        drop(g);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_lock_names_are_sanitized() {
        let (_dir, reg) = registry();
        let path = reg.path_for("failover_ifq_../eth0");
        assert_eq!(path.file_name().unwrap(), "failover_ifq_.._eth0.lock");
    }
}
