//! Execution coordinator.
//!
//! Validates a snippet, applies the text filter, dispatches it to one pooled
//! worker under a hard wall-clock deadline and packages the outcome. User-code
//! failures (rejected text, raised errors, timeouts) come back as an
//! `ExecutionResult`; only service malfunctions are returned as `Err`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecuteError;
use crate::policy::{
    rejected_substring, MAX_CODE_CHARS, NO_OUTPUT_PLACEHOLDER, POLICY_REJECTION_MESSAGE,
    TIMEOUT_MESSAGE,
};
use crate::pool::WorkerPool;
use crate::transport::RunOutcome;

/// A validated snippet and the budget it runs under.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    code: String,
    time_budget: Duration,
}

impl ExecutionRequest {
    /// Accepts 1 to `MAX_CODE_CHARS` characters of code.
    pub fn new(code: impl Into<String>, time_budget: Duration) -> Result<Self, ExecuteError> {
        let code = code.into();
        let chars = code.chars().count();
        if chars == 0 {
            return Err(ExecuteError::InvalidRequest("code must not be empty".into()));
        }
        if chars > MAX_CODE_CHARS {
            return Err(ExecuteError::InvalidRequest(format!(
                "code is {chars} characters, the limit is {MAX_CODE_CHARS}"
            )));
        }
        Ok(Self { code, time_budget })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub const fn time_budget(&self) -> Duration {
        self.time_budget
    }
}

/// What the caller gets back for every snippet that was accepted.
///
/// Serializes as the outbound `{output, error, timed_out}` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn timed_out() -> Self {
        Self {
            output: String::new(),
            error: Some(TIMEOUT_MESSAGE.to_string()),
            timed_out: true,
        }
    }

    pub fn policy_rejection() -> Self {
        Self {
            output: String::new(),
            error: Some(POLICY_REJECTION_MESSAGE.to_string()),
            timed_out: false,
        }
    }

    /// Package a finished run. A raised error wins over stderr text.
    pub fn from_outcome(outcome: RunOutcome) -> Self {
        let (output, error) = match outcome {
            RunOutcome::Completed { stdout, stderr } => {
                (stdout, Some(stderr).filter(|s| !s.is_empty()))
            }
            RunOutcome::Raised { stdout, message } => (stdout, Some(message)),
        };

        let output = if output.is_empty() && error.is_none() {
            NO_OUTPUT_PLACEHOLDER.to_string()
        } else {
            output
        };

        Self {
            output,
            error,
            timed_out: false,
        }
    }
}

/// Runs snippets on a shared worker pool.
pub struct Coordinator {
    pool: Arc<WorkerPool>,
    time_budget: Duration,
}

impl Coordinator {
    pub const fn new(pool: Arc<WorkerPool>, time_budget: Duration) -> Self {
        Self { pool, time_budget }
    }

    pub const fn time_budget(&self) -> Duration {
        self.time_budget
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run `code` with the configured time budget.
    pub async fn run(&self, code: &str) -> Result<ExecutionResult, ExecuteError> {
        self.execute(code, self.time_budget).await
    }

    /// Run `code`, giving it at most `budget` of wall-clock time once it
    /// reaches a worker.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn execute(
        &self,
        code: &str,
        budget: Duration,
    ) -> Result<ExecutionResult, ExecuteError> {
        let request = ExecutionRequest::new(code, budget)?;

        if let Some(pattern) = rejected_substring(request.code()) {
            info!(pattern, "Rejected snippet before dispatch");
            return Ok(ExecutionResult::policy_rejection());
        }

        let mut worker = self.pool.claim().await?;
        let deadline = Instant::now() + request.time_budget();
        debug!(worker = worker.id(), pid = ?worker.pid(), "Dispatching snippet");

        match tokio::time::timeout_at(deadline, worker.submit(request.code())).await {
            Ok(Ok(outcome)) => {
                self.pool.release(worker).await;
                let result = ExecutionResult::from_outcome(outcome);
                debug!(has_error = result.error.is_some(), "Snippet finished");
                Ok(result)
            }
            Ok(Err(e)) => {
                warn!(worker = worker.id(), error = %format!("{e:#}"), "Worker failed");
                self.pool.replace(worker).await;
                Err(ExecuteError::Internal(e))
            }
            Err(_) => {
                warn!(
                    worker = worker.id(),
                    budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                    "Snippet exceeded its time budget"
                );
                self.pool.replace(worker).await;
                Ok(ExecutionResult::timed_out())
            }
        }
    }
}
