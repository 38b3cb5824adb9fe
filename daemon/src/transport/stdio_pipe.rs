//! Stdin/stdout pipe transport for worker processes.
//!
//! Owns a child process, communicates via length-prefixed JSON on
//! the child's stdin (requests) and stdout (responses).

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::protocol::{WorkerRequest, WorkerResponse};
use super::{recv_message, send_json, Transport};

/// How long a graceful shutdown may take before the worker is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Transport that communicates with a worker via stdin/stdout pipes.
///
/// The worker process is spawned once and kept alive across executions.
/// Each `request()` call acquires both stdin and stdout mutexes to ensure
/// atomic send/receive (no interleaving from concurrent callers).
pub struct StdioPipeTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<ChildStdout>,
    pid: Option<u32>,
    alive: AtomicBool,
}

impl StdioPipeTransport {
    /// Spawn a worker process from `cmd` and wait for its `Ready` message.
    ///
    /// The worker's stderr is inherited so its diagnostics land in the
    /// daemon's log stream. The child is killed if the transport is dropped.
    pub async fn spawn(mut cmd: Command, ready_timeout: Duration) -> Result<Self> {
        debug!(command = ?cmd.as_std(), "Spawning worker process");

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker: {:?}", cmd.as_std().get_program()))?;

        let pid = child.id();
        let stdin = child.stdin.take().context("Failed to take worker stdin")?;
        let mut stdout = child.stdout.take().context("Failed to take worker stdout")?;

        // Wait for the worker's Ready message
        let ready_bytes = tokio::time::timeout(ready_timeout, recv_message(&mut stdout))
            .await
            .map_err(|_| anyhow::anyhow!("Worker did not send Ready within {ready_timeout:?}"))?
            .context("Failed to read worker Ready message")?;

        let ready_msg: WorkerResponse = serde_json::from_slice(&ready_bytes)
            .context("Failed to parse worker Ready message")?;

        match ready_msg {
            WorkerResponse::Ready => {
                debug!(pid = ?pid, "Worker is ready");
            }
            other => {
                anyhow::bail!("Expected Ready message, got: {other:?}");
            }
        }

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            pid,
            alive: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl Transport for StdioPipeTransport {
    async fn request(&self, req: &WorkerRequest) -> Result<WorkerResponse> {
        if !self.alive.load(Ordering::Relaxed) {
            anyhow::bail!("Worker process is not alive");
        }

        // Acquire both locks for atomic send/receive
        let mut stdin = self.stdin.lock().await;
        let mut stdout = self.stdout.lock().await;

        let exchange = async {
            send_json(&mut *stdin, req)
                .await
                .context("Failed to send request to worker")?;

            let resp_bytes = recv_message(&mut *stdout)
                .await
                .context("Failed to read response from worker")?;

            serde_json::from_slice::<WorkerResponse>(&resp_bytes)
                .context("Failed to parse worker response")
        };

        let resp = exchange.await;
        if resp.is_err() {
            // A broken pipe or garbled frame means the channel is unusable
            self.alive.store(false, Ordering::Relaxed);
        }
        resp
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.alive.load(Ordering::Relaxed) {
            self.kill().await;
            return Ok(());
        }

        // Try graceful shutdown first
        match tokio::time::timeout(SHUTDOWN_GRACE, self.request(&WorkerRequest::Shutdown)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "Graceful shutdown failed, killing worker"),
            Err(_) => warn!(pid = ?self.pid, "Worker did not acknowledge shutdown, killing it"),
        }

        self.kill().await;
        debug!(pid = ?self.pid, "Worker process shut down");
        Ok(())
    }

    async fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);

        let mut child = self.child.lock().await;
        // Already-exited children make kill() fail; that is fine
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::Relaxed) {
            return false;
        }
        // Best-effort exit check; a held lock means a request is in flight
        match self.child.try_lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => true,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
