//! Error taxonomy for the job execution core.

use crate::model::{JobId, RepositoryId, TaskIndex};

/// Errors that can occur when validating and accepting a new submission.
/// A `SubmitError` never starts a job.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("composite job must have at least one task")]
    EmptyTaskList,

    #[error("simple job command must not be empty")]
    EmptyCommand,

    #[error("unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("task {task} missing required parameter `{field}`")]
    MissingParam { task: String, field: &'static str },

    #[error("unknown {kind} config: {id}")]
    UnknownConfig { kind: &'static str, id: String },

    #[error("{kind} config {id} is disabled")]
    DisabledConfig { kind: &'static str, id: String },

    #[error("unknown repository: {0}")]
    UnknownRepository(String),

    #[error("unknown schedule: {0}")]
    UnknownSchedule(String),

    #[error("schedule {0} is disabled")]
    DisabledSchedule(String),
}

/// The child binary could not be launched at all.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn `{program}`: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Outcome of a single task's execution attempt.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("child exited with status {0}")]
    NonZeroExit(i32),

    #[error("cancelled")]
    CancelRequested,
}

/// Malformed output from an external tool. Listing callers degrade to an
/// empty result and log a warning rather than failing the job.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a `{{...}}` JSON object in output, found none")]
    NoJsonObject,

    #[error("progress line `{0}` does not match the expected format")]
    BadProgressLine(String),
}

/// Repository-probe access verification failure.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("listing command failed with status {0}")]
    NonZeroExit(i32),

    #[error("could not spawn verification command: {0}")]
    Spawn(#[from] SpawnError),

    #[error("listing output was not valid JSON: {0}")]
    Parse(#[from] ParseError),
}

/// Journal failures are always logged, never surfaced; in-memory state
/// remains authoritative for in-flight jobs.
#[derive(Debug, thiserror::Error)]
#[error("journal operation failed: {0}")]
pub struct JournalError(pub String);

/// Returned by [`crate::manager::Core::browse_archive`].
#[derive(Debug, thiserror::Error)]
pub enum ArchiveBrowseError {
    #[error("unknown repository: {0}")]
    UnknownRepository(RepositoryId),

    #[error(transparent)]
    List(#[from] crate::archive_tree::ArchiveListError),
}

/// Returned by [`crate::manager::Core::cancel`] style operations to
/// distinguish "not found" from "found but already terminal".
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("task index {1} out of range for job {0}")]
    TaskIndexOutOfRange(JobId, TaskIndex),
}
