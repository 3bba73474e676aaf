//! Error types for simcon.
//!
//! Per-job failures (`SimulationFailed`, `SimulationIncomplete`, `Timeout`) are
//! recorded against a single job. `Transport` aborts a whole controller run.
//! `TransientPoll` is swallowed by the controller and retried next cycle.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for simcon operations.
pub type Result<T> = std::result::Result<T, SimconError>;

/// Error type for all simcon operations.
#[derive(Error, Debug)]
pub enum SimconError {
    /// The simulator ran but signalled non-success.
    #[error("Simulation failed: {reason}")]
    SimulationFailed {
        /// Human-readable reason.
        reason: String,
    },

    /// The simulation has not (yet) produced complete output.
    #[error("Simulation incomplete: {reason}")]
    SimulationIncomplete {
        /// Human-readable reason.
        reason: String,
    },

    /// Wall-clock budget of a job exceeded.
    #[error("Simulation timeout exceeded after {}s", elapsed.as_secs())]
    Timeout {
        /// Time the job had been running when it was cancelled.
        elapsed: Duration,
    },

    /// Remote connection or authentication failure.
    #[error("Transport error ({host}): {message}")]
    Transport {
        /// Remote host the transport talks to.
        host: String,
        /// Human-readable error message.
        message: String,
    },

    /// Backend could not answer a poll this cycle.
    #[error("Transient poll error: {message}")]
    TransientPoll {
        /// Human-readable error message.
        message: String,
    },

    /// Operation not supported by a backend.
    #[error("Operation not supported by {backend} backend: {operation}")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// Operation that was requested.
        operation: &'static str,
    },

    /// Invalid job, device or sweep configuration.
    #[error("Invalid job configuration: {reason}")]
    InvalidJob {
        /// Reason why the job is invalid.
        reason: String,
    },

    /// Result store inconsistency.
    #[error("Result store error at {}: {reason}", path.display())]
    Store {
        /// Store path involved.
        path: PathBuf,
        /// Reason.
        reason: String,
    },

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error for persisted result sets and markers.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SimconError {
    /// Returns true for errors that abort a whole controller run.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns true for errors that only mean "try again next cycle".
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientPoll { .. })
    }
}

impl From<serde_json::Error> for SimconError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SimconError::SimulationFailed {
            reason: "exit code 3".to_string(),
        };
        assert!(format!("{err}").contains("Simulation failed"));
    }

    #[test]
    fn test_timeout_error() {
        let err = SimconError::Timeout {
            elapsed: Duration::from_secs(30),
        };
        assert!(format!("{err}").contains("30"));
    }

    #[test]
    fn test_classification() {
        let transport = SimconError::Transport {
            host: "cluster".to_string(),
            message: "permission denied".to_string(),
        };
        assert!(transport.is_transport());
        assert!(!transport.is_transient());

        let poll = SimconError::TransientPoll {
            message: "timeout".to_string(),
        };
        assert!(poll.is_transient());
        assert!(!poll.is_transport());
    }

    #[test]
    fn test_store_error_display() {
        let err = SimconError::Store {
            path: PathBuf::from("/sim/dut/sweep"),
            reason: "missing marker".to_string(),
        };
        assert!(format!("{err}").contains("/sim/dut/sweep"));
    }
}
