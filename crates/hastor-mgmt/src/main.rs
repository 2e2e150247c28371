use anyhow::Result;
use clap::Parser;
use hastor_mgmt::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    Cli::parse().run().await
}
