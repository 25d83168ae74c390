//! Fleetlink agent entry point.

mod app;
mod config;
mod dispatch;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetlink-agent", about = "Fleetlink node agent", version)]
struct Cli {
    /// Path to agent.toml (defaults to the platform config directory).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting fleetlink agent"
    );

    let config = config::Config::load(cli.config.as_deref())?;
    tracing::info!(name = %config.name, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}
