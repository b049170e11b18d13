//! Lodestar server entry point
//!
//! Loads configuration (file, then environment overrides), starts the
//! router service and its health monitor, and runs until a shutdown signal
//! triggers the bounded drain.

use anyhow::Result;
use clap::Parser;
use lodestar::config::RouterConfig;
use lodestar::service::RouterService;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lodestar", about = "AI request router for MCP tool callers")]
struct Args {
    /// Path to a JSON configuration file; environment variables override it
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Use the production preset as the base configuration
    #[arg(long)]
    production: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lodestar=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RouterConfig::load_from_file(path)?,
        None if args.production => RouterConfig::production(),
        None => RouterConfig::from_env()?,
    };
    info!(
        endpoints = config.endpoints.len(),
        workspace_root = %config.workspace_root.display(),
        "configuration loaded"
    );

    let service = RouterService::new(config)?;
    service.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    service.shutdown().await;
    Ok(())
}
