//! kidslearn-sandbox worker
//!
//! Spawned by the daemon. Speaks the length-prefixed JSON worker protocol on
//! stdin/stdout and runs each snippet in a fresh restricted environment.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use kidslearn_sandbox_daemon::worker;

/// Stack size for runtime and blocking threads; deep snippet recursion
/// needs more than the default.
const WORKER_STACK_BYTES: usize = 16 * 1024 * 1024;

fn main() -> Result<()> {
    // Logs go to stderr; stdout is reserved for protocol frames
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_stack_size(WORKER_STACK_BYTES)
        .build()
        .context("Failed to build worker runtime")?;

    runtime.block_on(worker::serve(tokio::io::stdin(), tokio::io::stdout()))
}
