//! In-process stand-ins for worker processes.
//!
//! A `FakeTransport` answers `Execute` by echoing the code back as stdout,
//! except for a few magic snippets that hang, raise or fail.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::backend::WorkerSpawner;
use crate::transport::{RunOutcome, Transport, WorkerRequest, WorkerResponse};

/// Never answers.
pub const HANG: &str = "while True: pass";
/// Answers with a raised error and partial output.
pub const RAISE: &str = "print('partial')\n1 / 0";
/// Produces no output at all.
pub const SILENT: &str = "x = 1";
/// The worker reports an internal error.
pub const BROKEN: &str = "<broken>";

#[derive(Default)]
pub struct FakeSpawner {
    spawned: AtomicUsize,
    killed: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
    fail: bool,
}

impl FakeSpawner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    /// Transports destroyed so far, whether killed first or not.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerSpawner for FakeSpawner {
    async fn spawn(&self) -> Result<Box<dyn Transport>> {
        anyhow::ensure!(!self.fail, "spawn refused");
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            alive: AtomicBool::new(true),
            killed: Arc::clone(&self.killed),
            dropped: Arc::clone(&self.dropped),
        }))
    }
}

struct FakeTransport {
    alive: AtomicBool,
    killed: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, req: &WorkerRequest) -> Result<WorkerResponse> {
        anyhow::ensure!(self.is_alive(), "Worker is dead");
        match req {
            WorkerRequest::Execute { id, code, .. } => {
                let outcome = match code.as_str() {
                    HANG => std::future::pending().await,
                    BROKEN => {
                        return Ok(WorkerResponse::Error {
                            message: "interpreter setup failed".to_string(),
                        })
                    }
                    RAISE => RunOutcome::Raised {
                        stdout: "partial\n".to_string(),
                        message: "division by zero".to_string(),
                    },
                    SILENT => RunOutcome::Completed {
                        stdout: String::new(),
                        stderr: String::new(),
                    },
                    other => RunOutcome::Completed {
                        stdout: format!("{other}\n"),
                        stderr: String::new(),
                    },
                };
                Ok(WorkerResponse::Result { id: *id, outcome })
            }
            WorkerRequest::Ping | WorkerRequest::Shutdown => Ok(WorkerResponse::Pong),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.killed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}
