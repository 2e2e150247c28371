//! Default-accept and default-drop packet filter rules.

use crate::error::CallResult;
use crate::exec::{execute, CommandSpec, Runner};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Firewall contract.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Remove the failover block so client traffic flows.
    async fn accept_all(&self) -> CallResult<()>;

    /// Drop all client traffic except loopback, VRRP advertisements and
    /// anything arriving on `allowed_ifaces` (the heartbeat link).
    async fn drop_all(&self, allowed_ifaces: &[String]) -> CallResult<()>;
}

const TABLE: &str = "inet hastor_failover";

/// [`Firewall`] backed by `nft -f -`.
#[derive(Clone)]
pub struct NftFirewall {
    runner: Arc<dyn Runner>,
}

impl NftFirewall {
    /// Create a wrapper that runs commands through `runner`.
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self { runner }
    }

    /// Ruleset applied by `drop_all`.
    pub fn drop_ruleset(allowed_ifaces: &[String]) -> String {
        let mut rules = format!(
            "add table {TABLE}\ndelete table {TABLE}\ntable {TABLE} {{\n\
             \tchain input {{\n\
             \t\ttype filter hook input priority 0; policy drop;\n\
             \t\tiifname \"lo\" accept\n\
             \t\tip protocol vrrp accept\n"
        );
        for ifname in allowed_ifaces {
            rules.push_str(&format!("\t\tiifname \"{}\" accept\n", ifname));
        }
        rules.push_str("\t}\n}\n");
        rules
    }

    /// Ruleset applied by `accept_all`.
    pub fn accept_ruleset() -> String {
        // Adding first makes the delete succeed when the table is absent.
        format!("add table {TABLE}\ndelete table {TABLE}\n")
    }

    async fn apply(&self, rules: String) -> CallResult<()> {
        execute(
            self.runner.as_ref(),
            CommandSpec::new(["nft", "-f", "-"]).with_input(rules.into_bytes()),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Firewall for NftFirewall {
    async fn accept_all(&self) -> CallResult<()> {
        info!("accepting network traffic");
        self.apply(Self::accept_ruleset()).await
    }

    async fn drop_all(&self, allowed_ifaces: &[String]) -> CallResult<()> {
        info!(allowed = ?allowed_ifaces, "blocking network traffic");
        self.apply(Self::drop_ruleset(allowed_ifaces)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRunner;

    #[test]
    fn test_drop_ruleset_keeps_heartbeat() {
        let rules = NftFirewall::drop_ruleset(&["ntb0".to_string()]);
        assert!(rules.contains("policy drop"));
        assert!(rules.contains("iifname \"ntb0\" accept"));
        assert!(rules.contains("ip protocol vrrp accept"));
    }

    #[tokio::test]
    async fn test_rules_go_through_stdin() {
        let runner = Arc::new(FakeRunner::new());
        let fw = NftFirewall::new(runner.clone());
        fw.accept_all().await.unwrap();
        assert_eq!(runner.calls()[0], vec!["nft", "-f", "-"]);
        assert_eq!(
            runner.inputs()[0].as_deref(),
            Some(NftFirewall::accept_ruleset().as_bytes())
        );
        fw.drop_all(&["ntb1".to_string()]).await.unwrap();
        let rules = String::from_utf8(runner.inputs()[1].clone().unwrap()).unwrap();
        assert!(rules.contains("iifname \"ntb1\" accept"));
    }
}
