//! Error types for dumptruck.

/// Top-level error type shared by every dumptruck crate.
#[derive(Debug, thiserror::Error)]
pub enum DumptruckError {
    /// A templated value referenced a variable that is absent and has no default.
    #[error("unresolved variable '{0}'")]
    UnresolvedVariable(String),

    /// The container runtime could not be reached or the process could not start.
    #[error("process launch failed: {0}")]
    ProcessLaunchFailure(String),

    /// The invoked process ran but exited non-zero.
    #[error("process exited with code {code}: {detail}")]
    ProcessExecutionFailure { code: i32, detail: String },

    /// Malformed cron expression or timezone.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Malformed template expression.
    #[error("template error: {0}")]
    Template(String),

    /// Manifest loading or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Variable store could not be loaded.
    #[error("variable store error: {0}")]
    Store(String),

    /// Run history database error.
    #[error("database error: {0}")]
    Database(String),

    /// Notification dispatch error.
    #[error("notify error: {0}")]
    Notify(String),

    /// The run was cancelled by an operator or shutdown.
    #[error("run cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DumptruckError {
    /// Launch and execution failures are retried; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProcessLaunchFailure(_) | Self::ProcessExecutionFailure { .. }
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, DumptruckError>;
