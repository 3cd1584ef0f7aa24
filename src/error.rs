//! Replay error types.

use thiserror::Error;

/// Errors raised while observing, deciding or acting on a page.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// There is no page or tab to drive.
    #[error("No active page to drive: {0}")]
    NoActiveTarget(String),

    /// The platform refused to produce a screenshot.
    #[error("Capture failed: {0}")]
    Capture(String),

    /// The oracle could not be reached or answered with a non-2xx status.
    #[error("Oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// The oracle answered with something that is not a valid reply.
    #[error("Oracle protocol error: {0}")]
    OracleProtocol(String),

    /// An action could not be applied to the page.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// A type action found no element to type into.
    #[error("No input element available to type into")]
    NoInputTarget,

    /// The step never converged within its iteration budget.
    #[error("Step did not succeed within {iterations} iterations: {last_reason}")]
    IterationBudgetExceeded { iterations: u32, last_reason: String },

    /// The caller cancelled the run.
    #[error("Run cancelled")]
    Cancelled,

    /// A script file could not be read, written or validated.
    #[error("Script error: {0}")]
    Script(String),
}

impl ReplayError {
    /// Per-iteration faults that count against the retry budget instead of
    /// ending the step immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplayError::Capture(_)
                | ReplayError::OracleUnavailable(_)
                | ReplayError::OracleProtocol(_)
                | ReplayError::Execution(_)
                | ReplayError::NoInputTarget
                | ReplayError::NoActiveTarget(_)
        )
    }
}

impl From<reqwest::Error> for ReplayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ReplayError::OracleProtocol(e.to_string())
        } else {
            ReplayError::OracleUnavailable(e.to_string())
        }
    }
}

impl From<std::io::Error> for ReplayError {
    fn from(e: std::io::Error) -> Self {
        ReplayError::Script(e.to_string())
    }
}

impl From<serde_json::Error> for ReplayError {
    fn from(e: serde_json::Error) -> Self {
        ReplayError::Script(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
