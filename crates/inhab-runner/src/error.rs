use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The planner produced output that cannot be turned into a usable plan.
/// The message is fed back to the planner on the next attempt.
#[derive(Debug, Clone, Error)]
#[error("harness error: {0}")]
pub struct HarnessError(pub String);

impl HarnessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A run-wide guard fired. Always fatal for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardTripped {
    #[error("guard tripped: run deadline of {0:?} exceeded")]
    Deadline(Duration),
    #[error("guard tripped: parent process {0} is no longer alive")]
    ParentExited(u32),
    #[error("guard tripped: run cancelled")]
    Cancelled,
}

/// The simulation engine never produced a usable result for an item.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("dispatch timeout: engine did not respond within {0:?}")]
    Timeout(Duration),
    #[error("dispatch failure: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(
        "checkpoint {path} is corrupt (checksum mismatch: recorded {recorded}, computed {computed}); \
         refusing to resume, delete the file to start a fresh run"
    )]
    ChecksumMismatch {
        path: PathBuf,
        recorded: String,
        computed: String,
    },
    #[error("checkpoint {path} is unreadable ({reason}); refusing to resume, delete the file to start a fresh run")]
    Unreadable { path: PathBuf, reason: String },
    #[error("checkpoint config mismatch on '{field}': checkpoint has {checkpoint}, current run has {current}")]
    ConfigMismatch {
        field: &'static str,
        checkpoint: String,
        current: String,
    },
}
