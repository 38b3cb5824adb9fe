//! Worker protocol message types.
//!
//! Length-prefixed JSON protocol for coordinator ↔ worker communication.
//! Messages are framed as: [4-byte BE length][JSON payload]

use serde::{Deserialize, Serialize};

/// Request sent from the coordinator to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Run a snippet in a fresh restricted environment.
    Execute {
        id: u64,
        code: String,
        max_output_bytes: usize,
    },
    /// Graceful shutdown.
    Shutdown,
    /// Health check.
    Ping,
}

/// Response sent from a worker to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Worker is ready to accept requests (sent on startup).
    Ready,
    /// Outcome of an `Execute` request.
    Result { id: u64, outcome: RunOutcome },
    /// Pong response to health check.
    Pong,
    /// The request could not be understood.
    Error { message: String },
}

/// What happened when a snippet ran inside the restricted environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The snippet ran to completion.
    Completed { stdout: String, stderr: String },
    /// The snippet raised; `stdout` holds what was printed before that point.
    Raised { stdout: String, message: String },
}

impl RunOutcome {
    pub fn stdout(&self) -> &str {
        match self {
            Self::Completed { stdout, .. } | Self::Raised { stdout, .. } => stdout,
        }
    }
}
