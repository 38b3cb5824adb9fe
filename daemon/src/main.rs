//! kidslearn-sandbox daemon
//!
//! MCP server that runs learner snippets on a pool of restricted workers.
//! Configuration comes from `--config`, `KIDSLEARN_SANDBOX_CONFIG` or defaults.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kidslearn_sandbox_daemon::{
    backend::Launcher,
    config::Config,
    coordinator::Coordinator,
    mcp,
    pool::{PoolConfig, WorkerPool},
};

#[derive(Parser, Debug)]
#[command(name = "kidslearn-sandbox-daemon")]
#[command(about = "MCP server for running learner code snippets in a restricted sandbox")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !args.stdio {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let launcher = Launcher::from_config(&config.isolation, config.worker_ready_timeout())
        .context("Failed to set up worker launcher")?;
    info!(
        worker = %launcher.worker_path().display(),
        backend = ?launcher.backend(),
        "Resolved worker binary"
    );

    let pool = Arc::new(
        WorkerPool::start(Arc::new(launcher), PoolConfig::from_config(&config))
            .await
            .context("Failed to start worker pool")?,
    );
    let sweeper = pool.start_sweeper();

    let coordinator = Arc::new(Coordinator::new(Arc::clone(&pool), config.time_budget()));
    let served = mcp::serve_stdio(coordinator).await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    pool.shutdown().await;

    served
}
