//! Storage pool import and export.

use crate::error::{CallError, CallResult, Errno};
use crate::exec::{CommandSpec, ExecOutput, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One pool as seen by the pool manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Pool name.
    pub name: String,
    /// Pool GUID.
    pub guid: String,
    /// Health string, e.g. `ONLINE` or `OFFLINE`.
    pub status: String,
}

impl PoolInfo {
    /// Whether the pool is imported and usable.
    pub fn is_imported(&self) -> bool {
        !self.status.eq_ignore_ascii_case("OFFLINE") && !self.status.eq_ignore_ascii_case("EXPORTED")
    }
}

/// Options for [`PoolService::import_by_guid`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Alternate mount root.
    pub altroot: Option<String>,
    /// Cache file to import from and record into.
    pub cachefile: Option<PathBuf>,
    /// Import even if the pool appears active elsewhere.
    pub force: bool,
}

/// Pool management contract.
#[async_trait]
pub trait PoolService: Send + Sync {
    /// All imported pools.
    async fn list(&self) -> CallResult<Vec<PoolInfo>>;

    /// Import a pool by GUID. A missing cache file or unknown pool fails
    /// with `ENOENT`.
    async fn import_by_guid(&self, guid: &str, opts: &ImportOptions) -> CallResult<()>;

    /// Export a pool.
    async fn export(&self, name: &str, force: bool) -> CallResult<()>;

    /// Current state of one pool, `None` if not imported.
    async fn status(&self, name: &str) -> CallResult<Option<PoolInfo>>;

    /// Load keys for the encrypted datasets of an imported pool.
    async fn unlock_datasets(&self, name: &str) -> CallResult<()>;
}

/// [`PoolService`] backed by the `zpool` and `zfs` commands.
#[derive(Clone)]
pub struct ZpoolCli {
    runner: Arc<dyn Runner>,
    import_timeout: Duration,
}

impl ZpoolCli {
    /// Create a wrapper that runs commands through `runner`.
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self {
            runner,
            import_timeout: Duration::from_secs(600),
        }
    }

    fn failure(spec: &CommandSpec, out: &ExecOutput) -> CallError {
        let stderr = out.stderr_str();
        let lower = stderr.to_ascii_lowercase();
        let errno = if out.timed_out {
            Errno::ETIMEDOUT
        } else if lower.contains("no such pool")
            || lower.contains("no such file")
            || lower.contains("cannot open")
        {
            Errno::ENOENT
        } else if lower.contains("busy") {
            Errno::EBUSY
        } else {
            Errno::EFAULT
        };
        CallError::new(errno, format!("{} failed: {}", spec.display(), stderr))
    }

    async fn run(&self, spec: CommandSpec) -> CallResult<ExecOutput> {
        let out = self.runner.run(spec.clone()).await?;
        if !out.success() {
            return Err(Self::failure(&spec, &out));
        }
        Ok(out)
    }
}

/// Parse `zpool list -H -o name,guid,health`.
pub fn parse_zpool_list(stdout: &str) -> Vec<PoolInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            let guid = fields.next()?.trim();
            let status = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(PoolInfo {
                name: name.to_string(),
                guid: guid.to_string(),
                status: status.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl PoolService for ZpoolCli {
    async fn list(&self) -> CallResult<Vec<PoolInfo>> {
        let out = self
            .run(CommandSpec::new(["zpool", "list", "-H", "-o", "name,guid,health"]))
            .await?;
        Ok(parse_zpool_list(&out.stdout_str()))
    }

    async fn import_by_guid(&self, guid: &str, opts: &ImportOptions) -> CallResult<()> {
        let mut argv = vec!["zpool".to_string(), "import".to_string()];
        if opts.force {
            argv.push("-f".into());
        }
        if let Some(altroot) = &opts.altroot {
            argv.push("-R".into());
            argv.push(altroot.clone());
        }
        match &opts.cachefile {
            Some(cache) => {
                argv.push("-c".into());
                argv.push(cache.display().to_string());
                argv.push("-o".into());
                argv.push(format!("cachefile={}", cache.display()));
            }
            None => {
                argv.push("-o".into());
                argv.push("cachefile=none".into());
            }
        }
        argv.push(guid.to_string());
        info!(guid, "importing pool");
        self.run(CommandSpec::new(argv).with_timeout(self.import_timeout))
            .await
            .map(|_| ())
    }

    async fn export(&self, name: &str, force: bool) -> CallResult<()> {
        let mut argv = vec!["zpool", "export"];
        if force {
            argv.push("-f");
        }
        argv.push(name);
        self.run(CommandSpec::new(argv)).await.map(|_| ())
    }

    async fn status(&self, name: &str) -> CallResult<Option<PoolInfo>> {
        Ok(self.list().await?.into_iter().find(|p| p.name == name))
    }

    async fn unlock_datasets(&self, name: &str) -> CallResult<()> {
        let spec = CommandSpec::new(["zfs", "load-key", "-r", name]);
        let out = self.runner.run(spec.clone()).await?;
        if !out.success() {
            warn!(pool = name, stderr = %out.stderr_str(), "failed to load dataset keys");
            return Err(CallError::new(
                Errno::EDATASETISLOCKED,
                format!("{}: {}", spec.display(), out.stderr_str()),
            ));
        }
        self.run(CommandSpec::new(["zfs", "mount", "-a"])).await.map(|_| ())
    }
}
