use crate::process::ProcessError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a process unit
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("No process has been started for this unit")]
    NotStarted,

    #[error("No stdout log file is configured for this unit")]
    LogUnavailable,

    #[error("Failed to open log file {}: {source}", path.display())]
    LogOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Process management error: {0}")]
    Process(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl UnitError {
    /// Check if this error is a violated precondition rather than an operational failure
    pub fn is_usage_error(&self) -> bool {
        matches!(self, UnitError::NotStarted | UnitError::LogUnavailable)
    }

    /// Check if this error was raised while launching the child
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            UnitError::Process(ProcessError::SpawnFailed(_) | ProcessError::EmptyEntrypoint)
        )
    }
}
