//! SCSI reservation daemon control.

use crate::error::CallResult;
use crate::exec::{CommandSpec, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How fencing should be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FencingMode {
    /// Refuse to start if the peer still holds reservations.
    Normal,
    /// Seize reservations unconditionally.
    Force,
}

/// Fencing daemon contract.
#[async_trait]
pub trait Fencing: Send + Sync {
    /// Start the daemon and return its startup exit code.
    async fn start(&self, mode: FencingMode) -> CallResult<i32>;

    /// Stop any running daemon on this node.
    async fn stop(&self) -> CallResult<()>;
}

/// [`Fencing`] backed by the `fenced` binary.
#[derive(Clone)]
pub struct FencedCli {
    runner: Arc<dyn Runner>,
    binary: String,
}

impl FencedCli {
    /// Create a wrapper that runs commands through `runner`.
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self {
            runner,
            binary: "fenced".to_string(),
        }
    }
}

#[async_trait]
impl Fencing for FencedCli {
    async fn start(&self, mode: FencingMode) -> CallResult<i32> {
        let mut argv = vec![self.binary.clone()];
        if mode == FencingMode::Force {
            argv.push("--force".into());
        }
        info!(?mode, "starting fenced");
        let out = self
            .runner
            .run(CommandSpec::new(argv).with_timeout(Duration::from_secs(60)))
            .await?;
        Ok(out.exit_code)
    }

    async fn stop(&self) -> CallResult<()> {
        // pkill exits 1 when nothing matched.
        let out = self
            .runner
            .run(CommandSpec::new(["pkill", "-9", "-x", self.binary.as_str()]))
            .await?;
        debug!(exit_code = out.exit_code, "stopped fenced");
        Ok(())
    }
}
