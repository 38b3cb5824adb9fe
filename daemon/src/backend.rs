//! Worker launch backends.
//!
//! A backend decides how the worker binary is started: directly as a child
//! process, or wrapped in a bubblewrap jail. Either way the result is a
//! `tokio::process::Command` handed to the transport.

mod jail;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::{BackendType, IsolationConfig};
use crate::transport::{StdioPipeTransport, Transport};

/// File name of the worker binary built alongside the daemon.
pub const WORKER_BINARY: &str = "kidslearn-sandbox-worker";

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of fresh, ready-to-use worker transports.
///
/// The pool only ever talks to workers through this trait, so tests can
/// substitute in-process fakes for real processes.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start one worker and wait until it is ready for requests.
    async fn spawn(&self) -> Result<Box<dyn Transport>>;
}

/// Builds commands that start worker processes.
#[derive(Debug, Clone)]
pub struct Launcher {
    backend: BackendType,
    worker_path: PathBuf,
    bwrap_path: PathBuf,
    ready_timeout: Duration,
}

impl Launcher {
    /// Create a launcher for an already-resolved worker binary.
    pub fn new(backend: BackendType, worker_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            worker_path: worker_path.into(),
            bwrap_path: PathBuf::from("bwrap"),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// How long a spawned worker may take to announce readiness.
    #[must_use]
    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    /// Create a launcher from configuration, resolving the worker binary.
    pub fn from_config(isolation: &IsolationConfig, ready_timeout: Duration) -> Result<Self> {
        let worker_path = match &isolation.worker_path {
            Some(path) => path.clone(),
            None => locate_worker_binary()?,
        };
        anyhow::ensure!(
            worker_path.exists(),
            "Worker binary not found at {}",
            worker_path.display()
        );

        Ok(Self {
            backend: isolation.backend,
            worker_path,
            bwrap_path: isolation.bwrap_path.clone(),
            ready_timeout,
        })
    }

    pub const fn backend(&self) -> BackendType {
        self.backend
    }

    pub fn worker_path(&self) -> &Path {
        &self.worker_path
    }

    /// Build the command for one worker process.
    pub fn command(&self) -> Command {
        let cmd = match self.backend {
            BackendType::Process => {
                let mut cmd = Command::new(&self.worker_path);
                // No ambient credentials or settings leak into the worker
                cmd.env_clear();
                if let Ok(filter) = std::env::var("RUST_LOG") {
                    cmd.env("RUST_LOG", filter);
                }
                cmd
            }
            BackendType::Jail => jail::command(&self.bwrap_path, &self.worker_path),
        };
        debug!(backend = ?self.backend, command = ?cmd.as_std(), "Built worker command");
        cmd
    }
}

#[async_trait]
impl WorkerSpawner for Launcher {
    async fn spawn(&self) -> Result<Box<dyn Transport>> {
        let transport = StdioPipeTransport::spawn(self.command(), self.ready_timeout)
            .await
            .with_context(|| format!("Failed to start worker {}", self.worker_path.display()))?;
        Ok(Box::new(transport))
    }
}

/// Find the worker binary next to the current executable.
fn locate_worker_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot determine current executable")?;
    let dir = exe
        .parent()
        .context("Current executable has no parent directory")?;
    let candidate = dir.join(WORKER_BINARY);
    anyhow::ensure!(
        candidate.exists(),
        "Could not find {WORKER_BINARY} next to {}. Set isolation.worker_path or SANDBOX_WORKER_PATH.",
        exe.display()
    );
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_backend_runs_worker_directly() {
        let launcher = Launcher::new(BackendType::Process, "/opt/sandbox/worker");
        let cmd = launcher.command();
        assert_eq!(cmd.as_std().get_program(), "/opt/sandbox/worker");
        assert_eq!(cmd.as_std().get_args().count(), 0);
    }

    #[test]
    fn process_backend_clears_environment() {
        let launcher = Launcher::new(BackendType::Process, "/opt/sandbox/worker");
        let cmd = launcher.command();
        // Only RUST_LOG may be forwarded
        assert!(cmd
            .as_std()
            .get_envs()
            .all(|(key, _)| key == "RUST_LOG"));
    }

    #[test]
    fn from_config_rejects_missing_binary() {
        let isolation = IsolationConfig {
            worker_path: Some(PathBuf::from("/nonexistent/kidslearn-sandbox-worker")),
            ..IsolationConfig::default()
        };
        let err = Launcher::from_config(&isolation, DEFAULT_READY_TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("Worker binary not found"));
    }

    #[test]
    fn from_config_accepts_existing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let worker = dir.path().join(WORKER_BINARY);
        std::fs::write(&worker, "#!/bin/sh\n").unwrap();

        let isolation = IsolationConfig {
            worker_path: Some(worker.clone()),
            backend: BackendType::Jail,
            ..IsolationConfig::default()
        };
        let launcher = Launcher::from_config(&isolation, DEFAULT_READY_TIMEOUT).unwrap();
        assert_eq!(launcher.worker_path(), worker.as_path());
        assert_eq!(launcher.backend(), BackendType::Jail);
    }
}
