//! `hastord` command line: `serve` runs the daemon, everything else talks
//! to a running daemon's admin API.

use crate::client::AdminClient;
use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

/// `hastord` command line.
#[derive(Debug, Parser)]
#[command(name = "hastord")]
#[command(about = "HA storage controller daemon and admin CLI", long_about = None)]
pub struct Cli {
    /// Admin API base URL.
    #[arg(short, long, default_value = "http://127.0.0.1:8443")]
    pub server: String,

    /// Admin bearer token.
    #[arg(short, long, env = "HASTOR_ADMIN_TOKEN")]
    pub token: Option<String>,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon.
    Serve {
        /// Configuration file.
        #[arg(short, long, default_value = "/etc/hastor/hastord.toml")]
        config: PathBuf,
    },
    /// Show failover status.
    Status,
    /// List jobs.
    Jobs {
        /// Only jobs of this method.
        #[arg(short, long)]
        method: Option<String>,
        /// Only jobs in this state, e.g. `RUNNING`.
        #[arg(short = 'S', long)]
        state: Option<String>,
    },
    /// Wait for a job and show its record.
    Wait {
        /// Job id.
        id: u64,
        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Abort a job.
    Abort {
        /// Job id.
        id: u64,
    },
    /// Promote this controller as if `ifname` had become master.
    ForceTakeover {
        /// Interface to take over on.
        ifname: String,
    },
    /// Directory services health.
    Health {
        /// Health operation.
        #[command(subcommand)]
        cmd: HealthCmd,
    },
}

/// Directory services health operations.
#[derive(Debug, Clone, Subcommand)]
pub enum HealthCmd {
    /// Show the current record.
    Status,
    /// Run a check pass.
    Check,
    /// Run a check pass with recovery.
    Recover,
}

impl Cli {
    /// Execute the parsed command.
    pub async fn run(self) -> Result<()> {
        let client = AdminClient::new(self.server.as_str(), self.token.clone());
        match self.command {
            Command::Serve { ref config } => crate::daemon::serve(config).await,
            Command::Status => {
                let status = client.get("/api/v1/failover/status").await?;
                print!("{}", render_status(&status));
                Ok(())
            }
            Command::Jobs { ref method, ref state } => {
                let mut query = Vec::new();
                if let Some(m) = method {
                    query.push(format!("method={m}"));
                }
                if let Some(s) = state {
                    query.push(format!("state={}", s.to_uppercase()));
                }
                let path = if query.is_empty() {
                    "/api/v1/jobs".to_string()
                } else {
                    format!("/api/v1/jobs?{}", query.join("&"))
                };
                let jobs = client.get(&path).await?;
                print!("{}", render_jobs(&jobs));
                Ok(())
            }
            Command::Wait { id, timeout } => {
                let path = match timeout {
                    Some(t) => format!("/api/v1/jobs/{id}/wait?timeout_secs={t}"),
                    None => format!("/api/v1/jobs/{id}/wait"),
                };
                let record = client.post::<Value>(&path, None).await?;
                println!("{}", serde_json::to_string_pretty(&record)?);
                Ok(())
            }
            Command::Abort { id } => {
                let record = client.post::<Value>(&format!("/api/v1/jobs/{id}/abort"), None).await?;
                println!("Job {id}: {}", record["state"].as_str().unwrap_or("UNKNOWN"));
                Ok(())
            }
            Command::ForceTakeover { ref ifname } => {
                let reply = client
                    .post("/api/v1/failover/force_takeover", Some(&json!({ "ifname": ifname })))
                    .await?;
                if reply["accepted"].as_bool().unwrap_or(false) {
                    println!("Takeover queued as job {}", reply["job_id"]);
                } else {
                    println!("Takeover ignored: {}", reply["reason"].as_str().unwrap_or("no reason given"));
                }
                Ok(())
            }
            Command::Health { ref cmd } => {
                let health = match cmd {
                    HealthCmd::Status => client.get("/api/v1/directoryservices/health").await?,
                    HealthCmd::Check => {
                        client
                            .post::<Value>("/api/v1/directoryservices/health/check", None)
                            .await?
                    }
                    HealthCmd::Recover => {
                        client
                            .post::<Value>("/api/v1/directoryservices/health/recover", None)
                            .await?
                    }
                };
                print!("{}", render_health(&health));
                Ok(())
            }
        }
    }
}

fn text(v: &Value) -> &str {
    v.as_str().unwrap_or("-")
}

fn render_status(status: &Value) -> String {
    let mut out = String::new();
    out.push_str(&format!("State: {}\n", text(&status["state"])));
    out.push_str(&format!("Disabled: {}\n", status["disabled"]));
    out.push_str(&format!("Halted: {}\n", status["halted"]));
    out.push_str(&format!(
        "Events: {} accepted, {} ignored\n",
        status["accepted"], status["ignored"]
    ));
    if let Some(history) = status["history"].as_array() {
        for change in history {
            out.push_str(&format!(
                "  {} {} -> {}\n",
                text(&change["at"]),
                text(&change["from"]),
                text(&change["to"])
            ));
        }
    }
    out
}

fn render_jobs(jobs: &Value) -> String {
    let mut out = format!("{:<8} {:<40} {:<10} {:>8}\n", "ID", "METHOD", "STATE", "PERCENT");
    out.push_str(&"-".repeat(69));
    out.push('\n');
    for job in jobs.as_array().into_iter().flatten() {
        out.push_str(&format!(
            "{:<8} {:<40} {:<10} {:>8}\n",
            job["id"],
            text(&job["method"]),
            text(&job["state"]),
            job["progress"]["percent"].as_f64().map_or("-".to_string(), |p| format!("{p:.0}")),
        ));
    }
    out
}

fn render_health(health: &Value) -> String {
    let mut out = format!(
        "Type: {}\nStatus: {}\n",
        text(&health["service_type"]),
        text(&health["status"])
    );
    if let Some(msg) = health["status_msg"].as_str() {
        out.push_str(&format!("Message: {msg}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_default_config() {
        let cli = Cli::try_parse_from(["hastord", "serve"]).unwrap();
        match cli.command {
            Command::Serve { config } => assert_eq!(config, PathBuf::from("/etc/hastor/hastord.toml")),
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.server, "http://127.0.0.1:8443");
    }

    #[test]
    fn test_parse_jobs_filter() {
        let cli = Cli::try_parse_from(["hastord", "jobs", "--method", "failover.events.vrrp_master", "-S", "failed"])
            .unwrap();
        match cli.command {
            Command::Jobs { method, state } => {
                assert_eq!(method.as_deref(), Some("failover.events.vrrp_master"));
                assert_eq!(state.as_deref(), Some("failed"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_health_and_takeover() {
        let cli = Cli::try_parse_from(["hastord", "--token", "t", "health", "recover"]).unwrap();
        assert!(matches!(cli.command, Command::Health { cmd: HealthCmd::Recover }));
        assert_eq!(cli.token.as_deref(), Some("t"));

        let cli = Cli::try_parse_from(["hastord", "force-takeover", "eth0"]).unwrap();
        assert!(matches!(cli.command, Command::ForceTakeover { ref ifname } if ifname == "eth0"));
    }

    #[test]
    fn test_render_helpers() {
        let status = json!({
            "state": "MASTER", "disabled": false, "halted": false, "accepted": 2, "ignored": 1,
            "history": [{"at": "2026-01-01T00:00:00Z", "from": "PROMOTING", "to": "MASTER"}],
        });
        let out = render_status(&status);
        assert!(out.contains("State: MASTER"));
        assert!(out.contains("PROMOTING -> MASTER"));

        let jobs = json!([{"id": 7, "method": "core.noop", "state": "SUCCESS", "progress": {"percent": 100.0}}]);
        assert!(render_jobs(&jobs).contains("core.noop"));

        let health = json!({"service_type": "AD", "status": "FAULTED", "status_msg": "winbind down"});
        assert!(render_health(&health).contains("Message: winbind down"));
    }
}
