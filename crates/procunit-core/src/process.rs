use crate::stdio::UnitStdio;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was asked to stop and did so
    Success,
    /// Process ignored the graceful request and was killed after the grace period
    Escalated,
    /// There was no live process, nothing was done
    NotRunning,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Check if the process is known to be stopped after this operation
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::Escalated | TerminationResult::NotRunning
        )
    }
}

/// Error types for process operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Entrypoint is empty")]
    EmptyEntrypoint,
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("Process was already started by this handle")]
    AlreadyStarted,
    #[error("Process was never started by this handle")]
    NotStarted,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Where one output stream of a child process goes
pub enum OutputTarget {
    /// An opened log file, handed to the child as its descriptor
    File(File),
    /// The unit's default sink, fed through a pipe
    Sink(UnitStdio),
}

impl OutputTarget {
    pub fn is_file(&self) -> bool {
        matches!(self, OutputTarget::File(_))
    }

    /// Share this target with a second stream.
    ///
    /// A file is duplicated, so both descriptors refer to the same open file
    /// description and share one write offset.
    pub fn try_clone(&self) -> std::io::Result<OutputTarget> {
        match self {
            OutputTarget::File(file) => Ok(OutputTarget::File(file.try_clone()?)),
            OutputTarget::Sink(sink) => Ok(OutputTarget::Sink(sink.clone())),
        }
    }
}

/// Everything a launcher needs to create a handle for one child process
pub struct LaunchSpec {
    pub entrypoint: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub stdout: OutputTarget,
    pub stderr: OutputTarget,
}

/// Trait representing a handle to one child process
///
/// A handle is bound to exactly one process instance. It is created unstarted by a
/// [`ProcessLauncher`], started once, and never restarted.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if the process was never spawned)
    fn pid(&self) -> Option<ProcessId>;

    /// Get the command and arguments this handle runs
    fn entrypoint(&self) -> &[String];

    /// Spawn the process
    async fn start(&mut self) -> Result<(), ProcessError>;

    /// Check if the process is still running (non-blocking)
    fn alive(&mut self) -> bool;

    /// Exit code of the process, None while it runs or if it never started
    fn exit_code(&mut self) -> Option<i32>;

    /// Ask the process to stop.
    ///
    /// With `force` the process is killed at once. Otherwise it gets `grace_period`
    /// to exit before the handle escalates to a kill.
    async fn terminate(&mut self, force: bool, grace_period: Duration) -> TerminationResult;

    /// Wait for the process to exit, returns None if `timeout` elapsed first
    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>, ProcessError>;
}

/// Creates platform-specific process handles
pub trait ProcessLauncher: Send + Sync {
    /// The type of process handle this launcher produces
    type Handle: ProcessHandle;

    /// Check that `entrypoint` can be launched, without touching any output destination.
    ///
    /// Runs before a unit retires its previous run. The default only rejects an
    /// empty entrypoint.
    fn check_entrypoint(
        &self,
        entrypoint: &[String],
        _env: &HashMap<String, String>,
        _working_directory: Option<&Path>,
    ) -> Result<(), ProcessError> {
        if entrypoint.is_empty() {
            return Err(ProcessError::EmptyEntrypoint);
        }
        Ok(())
    }

    /// Create an unstarted handle for the given launch spec
    fn create(&self, spec: LaunchSpec) -> Self::Handle;

    /// Get the platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

/// Factory trait for creating platform-specific launchers
pub trait ProcessLauncherFactory {
    /// The type of launcher this factory creates
    type Launcher: ProcessLauncher;

    /// Create a launcher for the current platform
    fn create_launcher() -> Self::Launcher;
}

/// Implementation of ProcessHandle for boxed trait objects
#[async_trait]
impl ProcessHandle for Box<dyn ProcessHandle> {
    fn pid(&self) -> Option<ProcessId> {
        (**self).pid()
    }

    fn entrypoint(&self) -> &[String] {
        (**self).entrypoint()
    }

    async fn start(&mut self) -> Result<(), ProcessError> {
        (**self).start().await
    }

    fn alive(&mut self) -> bool {
        (**self).alive()
    }

    fn exit_code(&mut self) -> Option<i32> {
        (**self).exit_code()
    }

    async fn terminate(&mut self, force: bool, grace_period: Duration) -> TerminationResult {
        (**self).terminate(force, grace_period).await
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>, ProcessError> {
        (**self).wait(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_result_is_stopped() {
        assert!(TerminationResult::Success.is_stopped());
        assert!(TerminationResult::Escalated.is_stopped());
        assert!(TerminationResult::NotRunning.is_stopped());
        assert!(!TerminationResult::AccessDenied.is_stopped());
        assert!(!TerminationResult::Failed("EINVAL".to_string()).is_stopped());
    }

    #[test]
    fn test_file_target_clone_shares_offset() {
        use std::io::{Read, Seek, SeekFrom, Write};

        let path = std::env::temp_dir().join(format!(
            "procunit-target-{}.log",
            std::process::id()
        ));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        let first = OutputTarget::File(file);
        let second = first.try_clone().unwrap();
        assert!(second.is_file());

        if let (OutputTarget::File(mut a), OutputTarget::File(mut b)) = (first, second) {
            a.write_all(b"out\n").unwrap();
            b.write_all(b"err\n").unwrap();
            a.seek(SeekFrom::Start(0)).unwrap();
            let mut content = String::new();
            a.read_to_string(&mut content).unwrap();
            assert_eq!(content, "out\nerr\n");
        }

        let _ = std::fs::remove_file(&path);
    }
}
