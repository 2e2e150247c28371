//! `hastord serve`: logging setup, core construction and the signal-driven
//! shutdown sequence.

use crate::api::AdminApi;
use crate::config::{LogFormat, MgmtConfig};
use crate::core::Core;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Run the daemon until SIGINT or SIGTERM.
pub async fn serve(config_path: &Path) -> Result<()> {
    let config = MgmtConfig::load_or_default(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_tracing(config.log_format);
    if !config_path.exists() {
        tracing::warn!("config file not found, using defaults: {}", config_path.display());
    }

    let core = Arc::new(Core::system(config).context("building daemon core")?);
    let token = CancellationToken::new();
    let mut tasks = core.start(token.clone());

    tokio::spawn({
        let token = token.clone();
        async move {
            wait_for_signal().await;
            tracing::info!("shutdown requested");
            token.cancel();
        }
    });

    let served = AdminApi::new(core.clone()).serve(token.clone()).await;
    token.cancel();

    core.queue().shutdown();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "background task failed");
        }
    }
    tracing::info!("hastord stopped");
    served
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
