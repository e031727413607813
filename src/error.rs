use std::path::PathBuf;

use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::executor::MigrationResult;
use crate::state::Stage;

#[derive(Debug, Error)]
pub enum DocforgeError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Plan error: {0}")]
    Plan(String),

    #[error("Nothing to resume: {0}")]
    NotResumable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of a queued request that never produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Dropped by `clear()` before it was dispatched.
    #[error("request cancelled before dispatch")]
    Cancelled,

    /// The unit of work went away without settling (it panicked or the queue shut down).
    #[error("request abandoned before it settled")]
    Abandoned,
}

/// Raised by the cost tracker when recording usage would pass the ceiling.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("budget exceeded: recording would bring total cost to ${attempted:.4}, limit is ${limit:.4}")]
pub struct BudgetExceeded {
    /// Total cost the ledger would have reached.
    pub attempted: f64,
    pub limit: f64,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid workflow state: {0}")]
    Invalid(String),

    #[error("Cannot downgrade state from version {from} to {to}")]
    Downgrade { from: String, to: String },

    #[error("Unknown state version: {0}")]
    UnknownVersion(String),

    #[error("No migration path from version {from} to {to}")]
    NoMigrationPath { from: String, to: String },

    #[error("state migration {key} failed: {reason}")]
    MigrationFailed { key: String, reason: String },

    #[error("invalid stage transition from {from} to {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("no workflow state has been loaded or created")]
    NotInitialized,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("A migration is already in progress (pid {pid}, lock held for {age_secs}s)")]
    AlreadyInProgress { pid: u32, age_secs: u64 },

    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of a single task inside the worker. Local to that task.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to read source {path}: {source}")]
    ReadSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write target {path}: {source}")]
    WriteTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Api(#[from] AnthropicError),

    #[error("model returned no text content")]
    EmptyResponse,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor has been cancelled")]
    Cancelled,

    #[error("executor is already running a plan")]
    AlreadyRunning,

    /// The ledger refused a settlement; in-flight tasks were drained first.
    #[error("run halted: {error}")]
    BudgetExceeded {
        error: BudgetExceeded,
        partial: Box<MigrationResult>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_display() {
        let err = BudgetExceeded {
            attempted: 10.5,
            limit: 10.0,
        };
        assert_eq!(
            err.to_string(),
            "budget exceeded: recording would bring total cost to $10.5000, limit is $10.0000"
        );
    }

    #[test]
    fn lock_contention_names_pid() {
        let err = LockError::AlreadyInProgress {
            pid: 4242,
            age_secs: 12,
        };
        assert!(err.to_string().contains("pid 4242"));
        assert!(err.to_string().contains("already in progress"));
    }

    #[test]
    fn downgrade_message() {
        let err = StateError::Downgrade {
            from: "9.0.0".into(),
            to: "1.1.0".into(),
        };
        assert!(err.to_string().starts_with("Cannot downgrade"));
    }
}
