//! Service-level failures surfaced by the coordinator.
//!
//! User-code outcomes (policy rejection, runtime error, timeout) are never
//! errors; they come back as an `ExecutionResult`. Only the conditions below
//! reach the caller as `Err`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The request violates the inbound contract (empty or too long).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No worker became available (reject policy, or queue wait exceeded).
    #[error("all sandbox workers are busy (waited {waited:?})")]
    Busy { waited: Duration },

    /// Pool or transport malfunction unrelated to the submitted code.
    #[error("internal sandbox failure: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ExecuteError {
    /// Whether the failure is the caller's fault rather than the service's.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_keeps_context_chain() {
        let err: ExecuteError = anyhow::anyhow!("broken pipe")
            .context("Failed to send request to worker")
            .into();
        let msg = err.to_string();
        assert!(msg.contains("Failed to send request to worker"));
        assert!(msg.contains("broken pipe"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn invalid_request_is_client_error() {
        assert!(ExecuteError::InvalidRequest("empty".into()).is_client_error());
        assert!(!ExecuteError::Busy { waited: Duration::ZERO }.is_client_error());
    }
}
