//! The other controller of the HA pair.

use crate::error::{CallError, CallResult, Errno};
use crate::fsutil::atomic_write;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Remote controller contract.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Whether the peer reports itself active.
    async fn is_master(&self) -> CallResult<bool>;

    /// Ask the peer to recompute its failover status.
    async fn refresh_status(&self) -> CallResult<()>;

    /// Copy the peer's dataset encryption keys to the local key store.
    async fn sync_keys(&self) -> CallResult<()>;
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    state: String,
}

/// [`Peer`] reached over the peer's admin endpoint on the heartbeat link.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    keystore: PathBuf,
}

impl HttpPeer {
    /// Create a client for the peer at `base_url`. Synced keys are written
    /// to `keystore`.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        keystore: impl Into<PathBuf>,
        timeout: Duration,
    ) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::new(Errno::EFAULT, e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            keystore: keystore.into(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> CallResult<reqwest::Response> {
        let resp = req.send().await.map_err(remote_error)?;
        if !resp.status().is_success() {
            return Err(CallError::new(
                Errno::EREMOTENODEERROR,
                format!("peer returned {}", resp.status()),
            ));
        }
        Ok(resp)
    }
}

fn remote_error(e: reqwest::Error) -> CallError {
    let errno = if e.is_timeout() {
        Errno::ETIMEDOUT
    } else {
        Errno::EREMOTENODEERROR
    };
    CallError::new(errno, format!("peer request failed: {e}"))
}

#[async_trait]
impl Peer for HttpPeer {
    async fn is_master(&self) -> CallResult<bool> {
        let resp = self
            .send(self.request(reqwest::Method::GET, "/api/v1/failover/status"))
            .await?;
        let reply: StatusReply = resp.json().await.map_err(remote_error)?;
        debug!(state = %reply.state, "peer failover state");
        Ok(reply.state == "MASTER")
    }

    async fn refresh_status(&self) -> CallResult<()> {
        self.send(self.request(reqwest::Method::POST, "/api/v1/failover/refresh_status"))
            .await?;
        Ok(())
    }

    async fn sync_keys(&self) -> CallResult<()> {
        let resp = self
            .send(self.request(reqwest::Method::GET, "/api/v1/failover/keys"))
            .await?;
        let body = resp.bytes().await.map_err(remote_error)?;
        serde_json::from_slice::<serde_json::Value>(&body).map_err(|e| {
            CallError::new(Errno::EREMOTENODEERROR, format!("peer sent invalid keys: {e}"))
        })?;
        atomic_write(&self.keystore, &body, 0o600)?;
        info!("synced encryption keys from peer");
        Ok(())
    }
}
