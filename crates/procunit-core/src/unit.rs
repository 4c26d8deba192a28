use crate::config::UnitConfig;
use crate::error::UnitError;
use crate::logs::LogReader;
use crate::process::{LaunchSpec, OutputTarget, ProcessHandle, ProcessId, ProcessLauncher, TerminationResult};
use crate::stdio::{UnitStdErr, UnitStdOut};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exit code reported when no exit code is available
pub const NO_EXIT_CODE: i32 = -1;

/// Coarse state of a unit, derived from its process handle on every query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// No process was ever started
    Uninit,
    Running,
    /// The process exited with code 0
    Completed,
    /// The process exited with a non-zero code or was killed
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitStatus::Uninit => "uninit",
            UnitStatus::Running => "running",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What `start` observed before returning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A process was already alive, nothing was spawned
    AlreadyRunning,
    /// The process exited before the timeout
    Completed { success: bool },
    /// The timeout elapsed while the process was still running
    StillRunning,
    /// No timeout was given, the process was spawned and left alone
    NotWaited,
}

impl StartOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StartOutcome::AlreadyRunning | StartOutcome::Completed { success: true }
        )
    }
}

/// Keys touched by an environment update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvUpdate {
    pub applied: Vec<String>,
    /// Keys whose value was not a string and was therefore left out
    pub dropped: Vec<String>,
}

/// Point-in-time description of a unit
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSummary {
    pub rank: i64,
    pub status: UnitStatus,
    pub entrypoint: Vec<String>,
    pub exit_code: i32,
    pub err_path: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl fmt::Display for UnitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self
            .err_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "Container rank {} status {} cmd {:?} code {} log {} \nenv {:?}",
            self.rank, self.status, self.entrypoint, self.exit_code, log, self.env
        )
    }
}

/// Supervises one child process.
///
/// A unit owns at most one live process handle. `start` replaces a retired handle
/// with a fresh one, it never reuses it. Status is never cached, it is read from
/// the handle on every query.
///
/// Captured stdout is read through one long-lived [`LogReader`]. All log operations
/// take `&mut self`, so callers sharing a unit are serialized by the borrow and see
/// one shared cursor. Callers that need a cursor of their own use
/// [`ProcessUnit::open_log_reader`].
pub struct ProcessUnit<L: ProcessLauncher> {
    config: UnitConfig,
    launcher: L,
    handle: Option<L::Handle>,
    log_reader: Option<LogReader>,
    out: UnitStdOut,
    err: UnitStdErr,
}

impl<L: ProcessLauncher> ProcessUnit<L> {
    pub fn new(config: UnitConfig, launcher: L) -> Self {
        Self::new_with_buffers(config, launcher, UnitStdOut::stdout(), UnitStdErr::stderr())
    }

    /// Create a unit whose fallback output goes to `out` and `err`
    pub fn new_with_buffers(
        config: UnitConfig,
        launcher: L,
        out: UnitStdOut,
        err: UnitStdErr,
    ) -> Self {
        Self {
            config,
            launcher,
            handle: None,
            log_reader: None,
            out,
            err,
        }
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.config.entrypoint
    }

    pub fn set_entrypoint<S: ToString, I: IntoIterator<Item = S>>(&mut self, entrypoint: I) {
        self.config.entrypoint = entrypoint.into_iter().map(|s| s.to_string()).collect();
    }

    pub fn rank(&self) -> i64 {
        self.config.rank
    }

    pub fn set_rank(&mut self, rank: i64) {
        self.config.rank = rank;
    }

    pub fn out_path(&self) -> Option<&Path> {
        self.config.out_path.as_deref()
    }

    pub fn set_out_path(&mut self, path: Option<PathBuf>) {
        self.config.out_path = path;
    }

    pub fn err_path(&self) -> Option<&Path> {
        self.config.err_path.as_deref()
    }

    pub fn set_err_path(&mut self, path: Option<PathBuf>) {
        self.config.err_path = path;
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.config.env
    }

    pub fn retry_budget(&self) -> u32 {
        self.config.timings.retry_budget
    }

    pub fn grace_period(&self) -> Duration {
        self.config.timings.grace_period()
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.env.insert(key.into(), value.into());
    }

    /// Merge `env` and then `extra` into the environment.
    ///
    /// Only string values are kept. Existing keys are overwritten, nothing is removed.
    pub fn update_env<I, J, K>(&mut self, env: I, extra: J) -> EnvUpdate
    where
        I: IntoIterator<Item = (K, Value)>,
        J: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut update = EnvUpdate::default();
        for (key, value) in env.into_iter().chain(extra) {
            let key = key.into();
            match value {
                Value::String(value) => {
                    self.config.env.insert(key.clone(), value);
                    update.applied.push(key);
                }
                _ => update.dropped.push(key),
            }
        }

        if !update.dropped.is_empty() {
            warn!(
                "Dropped non-string environment values for rank {}: {:?}",
                self.config.rank, update.dropped
            );
        }
        update
    }

    /// Pid of the current process, if one was spawned
    pub fn pid(&self) -> Option<ProcessId> {
        self.handle.as_ref().and_then(|h| h.pid())
    }

    /// Launch the process.
    ///
    /// With a non-zero `timeout` this polls until the process exits or the timeout
    /// elapses. Without one it returns right after spawning. If the current process
    /// is still alive nothing is spawned.
    pub async fn start(&mut self, timeout: Option<Duration>) -> Result<StartOutcome, UnitError> {
        let deadline = timeout.filter(|t| !t.is_zero()).map(|t| Instant::now() + t);

        if let Some(handle) = self.handle.as_mut() {
            if handle.alive() {
                debug!("Process for rank {} is already running", self.config.rank);
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        // Nothing of the previous run is touched until the new entrypoint is launchable
        self.launcher.check_entrypoint(
            &self.config.entrypoint,
            &self.config.env,
            self.config.working_directory.as_deref(),
        )?;

        // The old handle is retired, its log file is about to be truncated
        self.close_log_reader();

        let (stdout, stderr) = self.resolve_outputs();
        let spec = LaunchSpec {
            entrypoint: self.config.entrypoint.clone(),
            env: self.config.env.clone(),
            working_directory: self.config.working_directory.clone(),
            stdout,
            stderr,
        };

        let mut handle = self.launcher.create(spec);
        handle.start().await?;
        info!(
            "Started rank {} on {}: {:?} (PID: {:?})",
            self.config.rank,
            self.launcher.platform_name(),
            self.config.entrypoint,
            handle.pid()
        );

        let poll_interval = self.config.timings.poll_interval();
        let handle = self.handle.insert(handle);

        let Some(deadline) = deadline else {
            return Ok(StartOutcome::NotWaited);
        };

        loop {
            if !handle.alive() {
                let code = handle.exit_code().unwrap_or(NO_EXIT_CODE);
                info!("Rank {} exited with code {}", self.config.rank, code);
                return Ok(StartOutcome::Completed { success: code == 0 });
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Rank {} still running after start timeout", self.config.rank);
                return Ok(StartOutcome::StillRunning);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Close the log reader and ask the process to stop.
    ///
    /// A graceful request gives the process the configured grace period before
    /// the handle escalates. Returns `NotRunning` when there is nothing to stop.
    pub async fn terminate(&mut self, force: bool) -> TerminationResult {
        self.close_log_reader();

        let grace_period = self.config.timings.grace_period();
        let Some(handle) = self.handle.as_mut() else {
            return TerminationResult::NotRunning;
        };
        if !handle.alive() {
            return TerminationResult::NotRunning;
        }

        info!(
            "Terminating rank {} (PID: {:?}, force: {})",
            self.config.rank,
            handle.pid(),
            force
        );
        handle.terminate(force, grace_period).await
    }

    /// Wait for the current process to exit.
    ///
    /// Returns `Ok(None)` if `timeout` elapsed first. Fails if no process was ever started.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>, UnitError> {
        let handle = self.handle.as_mut().ok_or(UnitError::NotStarted)?;
        Ok(handle.wait(timeout).await?)
    }

    /// Exit code of the current process, or [`NO_EXIT_CODE`] if none is available yet
    pub fn exit_code(&mut self) -> i32 {
        self.handle
            .as_mut()
            .and_then(|h| h.exit_code())
            .unwrap_or(NO_EXIT_CODE)
    }

    pub fn status(&mut self) -> UnitStatus {
        let Some(handle) = self.handle.as_mut() else {
            return UnitStatus::Uninit;
        };
        if handle.alive() {
            return UnitStatus::Running;
        }
        match handle.exit_code() {
            Some(0) => UnitStatus::Completed,
            _ => UnitStatus::Failed,
        }
    }

    pub fn summary(&mut self) -> UnitSummary {
        UnitSummary {
            rank: self.config.rank,
            status: self.status(),
            entrypoint: self.config.entrypoint.clone(),
            exit_code: self.exit_code(),
            err_path: self.config.err_path.clone(),
            env: self.config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    /// Seek the shared log cursor to `from` and copy up to `max_lines` lines into `sink`.
    ///
    /// Returns the absolute offset the cursor ends at.
    pub async fn logs<W>(
        &mut self,
        sink: &mut W,
        from: SeekFrom,
        max_lines: usize,
    ) -> Result<u64, UnitError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let reader = self.log_reader().await?;
        Ok(reader.read_lines(sink, from, max_lines).await?)
    }

    /// Like [`ProcessUnit::logs`], writing the configured number of lines to the default stdout
    pub async fn print_logs(&mut self, from: SeekFrom) -> Result<u64, UnitError> {
        let max_lines = self.config.timings.log_lines;
        let out = self.out.inner();
        let mut sink = out.lock().await;
        self.logs(&mut *sink, from, max_lines).await
    }

    /// Copy the last `length` bytes of the captured stdout into `sink`, line aligned
    pub async fn tail<W>(&mut self, sink: &mut W, length: u64) -> Result<u64, UnitError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let max_lines = self.config.timings.log_lines;
        let reader = self.log_reader().await?;
        Ok(reader.tail(sink, length, max_lines).await?)
    }

    /// Like [`ProcessUnit::tail`], with the configured window and the default stdout
    pub async fn print_tail(&mut self) -> Result<u64, UnitError> {
        let length = self.config.timings.tail_bytes;
        let out = self.out.inner();
        let mut sink = out.lock().await;
        self.tail(&mut *sink, length).await
    }

    /// Open an independent reader on the captured stdout, with its own cursor
    pub async fn open_log_reader(&self) -> Result<LogReader, UnitError> {
        let path = self.config.out_path.as_ref().ok_or(UnitError::LogUnavailable)?;
        LogReader::open(path).await.map_err(|source| UnitError::LogOpen {
            path: path.clone(),
            source,
        })
    }

    async fn log_reader(&mut self) -> Result<&mut LogReader, UnitError> {
        let reader = match self.log_reader.take() {
            Some(reader) => reader,
            None => self.open_log_reader().await?,
        };
        Ok(self.log_reader.insert(reader))
    }

    fn close_log_reader(&mut self) {
        if let Some(reader) = self.log_reader.take() {
            debug!("Closed log reader on {}", reader.path().display());
        }
    }

    /// Pick the stdout and stderr destinations for a new child
    fn resolve_outputs(&self) -> (OutputTarget, OutputTarget) {
        let stdout = match open_log_file(self.config.out_path.as_deref()) {
            Some(file) => OutputTarget::File(file),
            None => OutputTarget::Sink(self.out.clone().into()),
        };

        let shared = self.config.out_path.is_some() && self.config.err_path == self.config.out_path;
        let stderr = if shared {
            match stdout.try_clone() {
                Ok(shared) => shared,
                Err(e) => {
                    warn!("Failed to share stdout with stderr, using default stderr: {}", e);
                    OutputTarget::Sink(self.err.clone().into())
                }
            }
        } else {
            match open_log_file(self.config.err_path.as_deref()) {
                Some(file) => OutputTarget::File(file),
                None => OutputTarget::Sink(self.err.clone().into()),
            }
        };

        (stdout, stderr)
    }
}

/// Open `path` for writing, creating missing parent directories.
///
/// Returns None if there is no path or it cannot be opened.
fn open_log_file(path: Option<&Path>) -> Option<File> {
    let path = path?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("Cannot create log directory {}: {}", dir.display(), e);
            return None;
        }
    }

    match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
    {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Cannot open log file {}: {}", path.display(), e);
            None
        }
    }
}
