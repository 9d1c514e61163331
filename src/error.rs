use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task tracker error: {0}")]
    Tracker(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Wave not found: {0}")]
    WaveNotFound(String),

    #[error("Task {task} depends on unknown task {missing}")]
    UnknownDependency { task: String, missing: String },

    #[error("Dependency cycle detected among tasks: {}", tasks.join(", "))]
    CycleDetected { tasks: Vec<String> },

    #[error("Failed to create workspace at {path}: {reason}")]
    WorkspaceCreationFailed { path: String, reason: String },

    #[error("Lease for {task} attempt {attempt} is held by pid {holder_pid}")]
    LeaseContention {
        task: String,
        attempt: u32,
        holder_pid: u32,
    },

    #[error("Agent call timed out after {0:?}")]
    AgentTimeout(Duration),

    #[error("Agent transport error: {0}")]
    AgentTransport(String),

    #[error("Reviewer output for {task} matched no known signal")]
    AmbiguousSignal { task: String },

    #[error("Task {task} still needs revision after {attempts} attempts")]
    RetryExhausted { task: String, attempts: u32 },

    #[error("Too many live workers (limit: {limit})")]
    SaturationExceeded { limit: usize },
}

impl Error {
    /// Classify this error for the run ledger.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownDependency { .. } => ErrorKind::UnknownDependency,
            Error::CycleDetected { .. } => ErrorKind::CycleDetected,
            Error::WorkspaceCreationFailed { .. } => ErrorKind::WorkspaceCreationFailed,
            Error::LeaseContention { .. } => ErrorKind::LeaseContention,
            Error::AgentTimeout(_) => ErrorKind::AgentTimeout,
            Error::AgentTransport(_) | Error::Http(_) => ErrorKind::AgentTransportError,
            Error::AmbiguousSignal { .. } => ErrorKind::AmbiguousSignal,
            Error::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Error::SaturationExceeded { .. } => ErrorKind::SaturationExceeded,
            _ => ErrorKind::Internal,
        }
    }
}

/// Persistable error classification recorded against tasks and attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownDependency,
    CycleDetected,
    WorkspaceCreationFailed,
    LeaseContention,
    AgentTimeout,
    AgentTransportError,
    AmbiguousSignal,
    RetryExhausted,
    SaturationExceeded,
    /// A dependency did not complete, so the task was never dispatched.
    DependencyFailed,
    Internal,
}

impl ErrorKind {
    /// Whether a task that failed with this kind gets another pass on resume.
    ///
    /// Ambiguous review output and exhausted retries are final.
    pub fn is_retryable_on_resume(&self) -> bool {
        matches!(
            self,
            ErrorKind::LeaseContention
                | ErrorKind::WorkspaceCreationFailed
                | ErrorKind::AgentTimeout
                | ErrorKind::AgentTransportError
                | ErrorKind::SaturationExceeded
                | ErrorKind::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownDependency => "unknown_dependency",
            ErrorKind::CycleDetected => "cycle_detected",
            ErrorKind::WorkspaceCreationFailed => "workspace_creation_failed",
            ErrorKind::LeaseContention => "lease_contention",
            ErrorKind::AgentTimeout => "agent_timeout",
            ErrorKind::AgentTransportError => "agent_transport_error",
            ErrorKind::AmbiguousSignal => "ambiguous_signal",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::SaturationExceeded => "saturation_exceeded",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
