//! Fixed-size pool of worker processes.
//!
//! Capacity is a fair semaphore with one permit per worker, so at most
//! `size` executions are in flight and waiters are served in arrival order.
//! A claimed worker carries its permit; the permit is only released after
//! the worker is either returned healthy or replaced by a fresh one, so the
//! pool never offers work to a worker that was forcibly interrupted.

#[cfg(test)]
pub(crate) mod fake;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, instrument, warn};

use crate::backend::WorkerSpawner;
use crate::config::{BusyPolicy, Config};
use crate::error::ExecuteError;
use crate::transport::{RunOutcome, Transport, WorkerRequest, WorkerResponse};

/// How long an idle worker may take to answer a health-check ping.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Parsed pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers (and concurrent executions).
    pub size: usize,

    /// What `claim` does when every worker is busy.
    pub busy_policy: BusyPolicy,

    /// Longest a queued claim waits before giving up.
    pub queue_timeout: Duration,

    /// Output cap forwarded to workers with each execution.
    pub max_output_bytes: usize,

    /// Retire workers after this many executions (0 = never).
    pub max_executions_per_worker: u64,

    /// Interval between health sweeps, if enabled.
    pub health_check_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            size: config.pool_size,
            busy_policy: config.busy_policy,
            queue_timeout: config.queue_timeout(),
            max_output_bytes: config.max_output_bytes,
            max_executions_per_worker: config.max_executions_per_worker,
            health_check_interval: config.health_check_interval(),
        }
    }
}

/// One live worker process and its bookkeeping.
pub struct Worker {
    id: u64,
    transport: Box<dyn Transport>,
    executions: u64,
}

impl Worker {
    fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    async fn ping(&self) -> bool {
        matches!(
            tokio::time::timeout(PING_TIMEOUT, self.transport.request(&WorkerRequest::Ping)).await,
            Ok(Ok(WorkerResponse::Pong))
        )
    }
}

/// A worker checked out of the pool, holding one unit of capacity.
///
/// Dropping it without `release`/`replace` kills the process (the transport
/// is `kill_on_drop`) and frees the capacity; the next claim spawns anew.
pub struct ClaimedWorker {
    worker: Worker,
    max_output_bytes: usize,
    permit: OwnedSemaphorePermit,
}

impl ClaimedWorker {
    pub const fn id(&self) -> u64 {
        self.worker.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker.transport.pid()
    }

    /// Run `code` on this worker. The returned future is the pending result;
    /// dropping it mid-flight leaves the worker unusable until `replace`d.
    pub async fn submit(&mut self, code: &str) -> Result<RunOutcome> {
        self.worker.executions += 1;
        let id = self.worker.executions;

        let req = WorkerRequest::Execute {
            id,
            code: code.to_owned(),
            max_output_bytes: self.max_output_bytes,
        };

        match self.worker.transport.request(&req).await? {
            WorkerResponse::Result { id: got, outcome } => {
                anyhow::ensure!(got == id, "Response id mismatch: expected {id}, got {got}");
                Ok(outcome)
            }
            WorkerResponse::Error { message } => anyhow::bail!("Worker reported an error: {message}"),
            other => anyhow::bail!("Unexpected worker response: {other:?}"),
        }
    }
}

/// Owns the worker processes for the lifetime of the daemon.
pub struct WorkerPool {
    spawner: Arc<dyn WorkerSpawner>,
    idle: Mutex<Vec<Worker>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    next_id: AtomicU64,
}

impl WorkerPool {
    /// Create an empty pool. Workers are spawned lazily on first claim.
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: PoolConfig) -> Self {
        Self {
            spawner,
            idle: Mutex::new(Vec::with_capacity(config.size)),
            permits: Arc::new(Semaphore::new(config.size)),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a pool and spawn every worker up front.
    pub async fn start(spawner: Arc<dyn WorkerSpawner>, config: PoolConfig) -> Result<Self> {
        let pool = Self::new(spawner, config);
        {
            let mut idle = pool.idle.lock().await;
            for _ in 0..pool.config.size {
                idle.push(pool.spawn_worker().await?);
            }
        }
        info!(size = pool.config.size, "Worker pool started");
        Ok(pool)
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of workers that could be claimed right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Number of spawned workers waiting in the pool.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn spawn_worker(&self) -> Result<Worker> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transport = self
            .spawner
            .spawn()
            .await
            .with_context(|| format!("Failed to spawn worker {id}"))?;
        debug!(worker = id, pid = ?transport.pid(), "Spawned worker");
        Ok(Worker {
            id,
            transport,
            executions: 0,
        })
    }

    /// Take one unit of capacity according to the busy policy.
    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ExecuteError> {
        match self.config.busy_policy {
            BusyPolicy::Reject => match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => Err(ExecuteError::Busy {
                    waited: Duration::ZERO,
                }),
                Err(TryAcquireError::Closed) => Err(pool_closed()),
            },
            BusyPolicy::Queue => {
                let wait = Arc::clone(&self.permits).acquire_owned();
                match tokio::time::timeout(self.config.queue_timeout, wait).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(pool_closed()),
                    Err(_) => Err(ExecuteError::Busy {
                        waited: self.config.queue_timeout,
                    }),
                }
            }
        }
    }

    /// Check out a worker, spawning one if no healthy idle worker exists.
    #[instrument(skip(self))]
    pub async fn claim(&self) -> Result<ClaimedWorker, ExecuteError> {
        let permit = self.acquire().await?;

        let reused = loop {
            let Some(worker) = self.idle.lock().await.pop() else {
                break None;
            };
            if worker.is_alive() {
                break Some(worker);
            }
            warn!(worker = worker.id, "Discarding dead idle worker");
            worker.transport.kill().await;
        };

        let worker = match reused {
            Some(worker) => worker,
            None => self.spawn_worker().await?,
        };

        debug!(worker = worker.id, "Claimed worker");
        Ok(ClaimedWorker {
            worker,
            max_output_bytes: self.config.max_output_bytes,
            permit,
        })
    }

    /// Forcibly stop the claimed worker's process. Idempotent.
    pub async fn terminate(&self, claimed: &mut ClaimedWorker) {
        warn!(worker = claimed.worker.id, pid = ?claimed.pid(), "Terminating worker");
        claimed.worker.transport.kill().await;
    }

    /// Terminate the claimed worker and put a fresh one in its place before
    /// its capacity is handed to anyone else.
    ///
    /// If the replacement cannot be spawned the slot stays vacant and the
    /// next claim spawns one instead.
    pub async fn replace(&self, mut claimed: ClaimedWorker) {
        self.terminate(&mut claimed).await;
        let ClaimedWorker { worker, permit, .. } = claimed;

        match self.spawn_worker().await {
            Ok(fresh) => {
                info!(old = worker.id, new = fresh.id, "Replaced worker");
                self.idle.lock().await.push(fresh);
            }
            Err(e) => {
                warn!(old = worker.id, error = %format!("{e:#}"), "Failed to spawn replacement worker");
            }
        }
        drop(permit);
    }

    /// Return a worker after a completed execution.
    ///
    /// Workers that died or reached their execution quota are replaced.
    pub async fn release(&self, claimed: ClaimedWorker) {
        let quota = self.config.max_executions_per_worker;
        if quota > 0 && claimed.worker.executions >= quota {
            debug!(worker = claimed.worker.id, executions = claimed.worker.executions, "Recycling worker");
            return self.replace(claimed).await;
        }
        if !claimed.worker.is_alive() {
            return self.replace(claimed).await;
        }

        let ClaimedWorker { worker, permit, .. } = claimed;
        self.idle.lock().await.push(worker);
        drop(permit);
    }

    /// Ping every idle worker and replace those that do not answer, then top
    /// the pool back up to its configured size.
    ///
    /// Skipped when any worker is busy; the next sweep catches up.
    pub async fn sweep(&self) {
        let Ok(size) = u32::try_from(self.config.size) else {
            return;
        };
        let Ok(permits) = Arc::clone(&self.permits).try_acquire_many_owned(size) else {
            debug!("Pool busy, skipping health sweep");
            return;
        };

        let workers = std::mem::take(&mut *self.idle.lock().await);
        let mut healthy = Vec::with_capacity(self.config.size);
        for worker in workers {
            if worker.ping().await {
                healthy.push(worker);
            } else {
                warn!(worker = worker.id, "Worker failed health check");
                worker.transport.kill().await;
            }
        }

        while healthy.len() < self.config.size {
            match self.spawn_worker().await {
                Ok(worker) => healthy.push(worker),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Health sweep could not spawn worker");
                    break;
                }
            }
        }

        self.idle.lock().await.extend(healthy);
        drop(permits);
    }

    /// Start the background health sweeper, if configured.
    ///
    /// Not started under `BusyPolicy::Reject`: a sweep holds every permit
    /// while it pings, which would turn requests arriving meanwhile into
    /// `Busy`. Dead workers are still caught on claim and release.
    ///
    /// Returns a `JoinHandle` that runs until aborted.
    pub fn start_sweeper(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.config.health_check_interval?;
        if self.config.busy_policy == BusyPolicy::Reject {
            debug!("Reject policy in effect, health sweeper disabled");
            return None;
        }
        let pool = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                debug!("Health sweep");
                pool.sweep().await;
            }
        }))
    }

    /// Refuse further claims and shut down every idle worker.
    pub async fn shutdown(&self) {
        self.permits.close();
        let workers = std::mem::take(&mut *self.idle.lock().await);
        for worker in &workers {
            info!(worker = worker.id, "Shutting down worker");
            if let Err(e) = worker.transport.shutdown().await {
                warn!(worker = worker.id, error = %e, "Error shutting down worker");
            }
        }
    }
}

fn pool_closed() -> ExecuteError {
    ExecuteError::Internal(anyhow::anyhow!("Worker pool is shut down"))
}
