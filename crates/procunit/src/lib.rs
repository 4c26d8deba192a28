//! Supervision of a single child process.
//!
//! A [`Container`] launches one command with a given environment, tracks its status,
//! stops it gracefully or by force, and reads back the stdout it captured to a file.
//!
//! ```no_run
//! use procunit::{StartOutcome, UnitConfig};
//! use std::io::SeekFrom;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), procunit::UnitError> {
//! let config = UnitConfig::builder()
//!     .entrypoint(["python", "train.py"])
//!     .rank(0)
//!     .env("MASTER_ADDR", "10.0.0.1")
//!     .out_path("/tmp/log/workerlog.0")
//!     .err_path("/tmp/log/workerlog.0")
//!     .build()
//!     .map_err(|e| procunit::UnitError::Configuration(e.to_string()))?;
//!
//! let mut container = procunit::container(config)?;
//! if let StartOutcome::StillRunning = container.start(Some(Duration::from_secs(3))).await? {
//!     container.print_logs(SeekFrom::Current(0)).await?;
//! }
//! container.terminate(false).await;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("procunit currently supports unix platforms only");

mod factory;

use tracing::debug;
use tracing_subscriber::EnvFilter;

pub use factory::{PlatformLauncher, PlatformLauncherFactory};

/// A process unit running on the launcher of the current platform
pub type Container = ProcessUnit<PlatformLauncher>;

/// Create a container whose fallback output goes to this process's stdout and stderr
pub fn container(config: UnitConfig) -> Result<Container, UnitError> {
    container_with_buffers(config, UnitStdOut::stdout(), UnitStdErr::stderr())
}

/// Create a container with custom fallback output sinks
pub fn container_with_buffers(
    config: UnitConfig,
    out: UnitStdOut,
    err: UnitStdErr,
) -> Result<Container, UnitError> {
    config
        .timings
        .validate()
        .map_err(|e| UnitError::Configuration(e.to_string()))?;

    let launcher = PlatformLauncherFactory::create_launcher();
    debug!(
        "Created container for rank {} on {}",
        config.rank,
        launcher.platform_name()
    );
    Ok(ProcessUnit::new_with_buffers(config, launcher, out, err))
}

/// Output format of [`init_tracing`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install a global tracing subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_target(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}

// Re-export core functionality
pub use procunit_core::*;
