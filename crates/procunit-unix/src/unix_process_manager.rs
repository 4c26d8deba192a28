use async_trait::async_trait;
use procunit_core::{
    LaunchSpec, NO_EXIT_CODE, OutputTarget, ProcessError, ProcessHandle, ProcessId,
    ProcessLauncher, TerminationResult,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Stdio};
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// How long to wait for the kernel to reap a process after SIGKILL
    const REAP_TIMEOUT: Duration = Duration::from_secs(5);

    /// Unix-specific process handle implementation
    ///
    /// The child is started in its own process group, so signals reach everything it spawned.
    pub struct UnixProcessHandle {
        spec: Option<LaunchSpec>,
        entrypoint: Vec<String>,
        child: Option<Child>,
        pid: Option<ProcessId>,
        exit: Option<i32>,
    }

    impl UnixProcessHandle {
        pub fn new(spec: LaunchSpec) -> Self {
            Self {
                entrypoint: spec.entrypoint.clone(),
                spec: Some(spec),
                child: None,
                pid: None,
                exit: None,
            }
        }

        /// Block until the process is gone, bounded by `REAP_TIMEOUT`
        async fn reap(&mut self) {
            match self.wait(Some(REAP_TIMEOUT)).await {
                Ok(Some(code)) => debug!("Reaped process {:?} with code {}", self.pid, code),
                Ok(None) => warn!("Process {:?} was not reaped after SIGKILL", self.pid),
                Err(e) => warn!("Failed to reap process {:?}: {}", self.pid, e),
            }
        }
    }

    /// Exit code of a finished child, signals map to 128 + signal number
    fn exit_code_of(status: ExitStatus) -> i32 {
        status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(NO_EXIT_CODE)
    }

    fn is_executable(path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    /// Locate `program` the way the child will: relative to its working directory when it
    /// contains a slash, otherwise through the `PATH` it will inherit.
    pub(crate) fn resolve_program(
        program: &str,
        env: &HashMap<String, String>,
        working_directory: Option<&Path>,
    ) -> Option<PathBuf> {
        if program.contains('/') {
            let path = match working_directory {
                Some(dir) if Path::new(program).is_relative() => dir.join(program),
                _ => PathBuf::from(program),
            };
            return is_executable(&path).then_some(path);
        }

        let search = env
            .get("PATH")
            .map(std::ffi::OsString::from)
            .or_else(|| std::env::var_os("PATH"))?;
        std::env::split_paths(&search)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }

    fn stdio_for(target: &OutputTarget) -> std::io::Result<Stdio> {
        match target {
            OutputTarget::File(file) => Ok(Stdio::from(file.try_clone()?)),
            OutputTarget::Sink(_) => Ok(Stdio::piped()),
        }
    }

    fn signal_group(pid: ProcessId, signal: Signal) -> TerminationResult {
        let pgid = NixPid::from_raw(pid as i32);

        match signal::killpg(pgid, signal) {
            Ok(()) => {
                info!("Sent {} to process group {}", signal, pid);
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => {
                info!("Process group {} not found (already terminated)", pid);
                TerminationResult::Success
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!("Permission denied to signal process group {}", pid);
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!("Failed to send {} to process group {}: {}", signal, pid, e);
                TerminationResult::Failed(format!("{signal} to process group failed: {e}"))
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn pid(&self) -> Option<ProcessId> {
            self.pid
        }

        fn entrypoint(&self) -> &[String] {
            &self.entrypoint
        }

        async fn start(&mut self) -> Result<(), ProcessError> {
            let spec = self.spec.take().ok_or(ProcessError::AlreadyStarted)?;
            let (program, args) = spec
                .entrypoint
                .split_first()
                .ok_or(ProcessError::EmptyEntrypoint)?;

            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd.envs(&spec.env);

            if let Some(dir) = &spec.working_directory {
                cmd.current_dir(dir);
            }

            cmd.stdin(Stdio::null());
            cmd.stdout(stdio_for(&spec.stdout)?);
            cmd.stderr(stdio_for(&spec.stderr)?);

            // New process group so termination reaches grandchildren too
            cmd.process_group(0);

            let mut child = cmd
                .spawn()
                .map_err(|e| ProcessError::SpawnFailed(format!("{program}: {e}")))?;

            if let (OutputTarget::Sink(sink), Some(mut pipe)) = (spec.stdout, child.stdout.take()) {
                tokio::spawn(async move {
                    if let Err(e) = procunit_core::stream(&mut pipe, sink).await {
                        warn!("Stdout forwarding stopped: {}", e);
                    }
                });
            }
            if let (OutputTarget::Sink(sink), Some(mut pipe)) = (spec.stderr, child.stderr.take()) {
                tokio::spawn(async move {
                    if let Err(e) = procunit_core::stream(&mut pipe, sink).await {
                        warn!("Stderr forwarding stopped: {}", e);
                    }
                });
            }

            self.pid = child.id();
            info!(
                "Spawned Unix process: {} (PID: {:?}) with args: {:?}",
                program, self.pid, args
            );
            self.child = Some(child);
            Ok(())
        }

        fn alive(&mut self) -> bool {
            if self.exit.is_some() {
                return false;
            }
            let Some(child) = self.child.as_mut() else {
                return false;
            };

            match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    let code = exit_code_of(status);
                    debug!("Unix process {:?} exited with code {}", self.pid, code);
                    self.exit = Some(code);
                    false
                }
                Err(e) => {
                    warn!("Failed to query process {:?}: {}", self.pid, e);
                    false
                }
            }
        }

        fn exit_code(&mut self) -> Option<i32> {
            self.alive();
            self.exit
        }

        async fn terminate(&mut self, force: bool, grace_period: Duration) -> TerminationResult {
            let Some(pid) = self.pid else {
                return TerminationResult::NotRunning;
            };
            if !self.alive() {
                return TerminationResult::NotRunning;
            }

            if force {
                let result = signal_group(pid, Signal::SIGKILL);
                if result == TerminationResult::Success {
                    self.reap().await;
                }
                return result;
            }

            let result = signal_group(pid, Signal::SIGTERM);
            if result != TerminationResult::Success {
                return result;
            }

            match self.wait(Some(grace_period)).await {
                Ok(Some(code)) => {
                    info!("Process {} exited with code {} after SIGTERM", pid, code);
                    TerminationResult::Success
                }
                _ => {
                    warn!(
                        "Process {} still running after {:?}, escalating to SIGKILL",
                        pid, grace_period
                    );
                    match signal_group(pid, Signal::SIGKILL) {
                        TerminationResult::Success => {
                            self.reap().await;
                            TerminationResult::Escalated
                        }
                        result => result,
                    }
                }
            }
        }

        async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>, ProcessError> {
            if let Some(code) = self.exit {
                return Ok(Some(code));
            }
            let child = self.child.as_mut().ok_or(ProcessError::NotStarted)?;

            let status = match timeout {
                Some(duration) => match tokio::time::timeout(duration, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => return Ok(None),
                },
                None => child.wait().await?,
            };

            let code = exit_code_of(status);
            self.exit = Some(code);
            Ok(Some(code))
        }
    }

    /// Unix launcher, creates handles that run in their own process group
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UnixLauncher;

    impl UnixLauncher {
        pub fn new() -> Self {
            info!("Initializing Unix process launcher");
            Self
        }
    }

    impl ProcessLauncher for UnixLauncher {
        type Handle = UnixProcessHandle;

        fn check_entrypoint(
            &self,
            entrypoint: &[String],
            env: &HashMap<String, String>,
            working_directory: Option<&Path>,
        ) -> Result<(), ProcessError> {
            let program = entrypoint.first().ok_or(ProcessError::EmptyEntrypoint)?;
            match resolve_program(program, env, working_directory) {
                Some(path) => {
                    debug!("Resolved {} to {}", program, path.display());
                    Ok(())
                }
                None => Err(ProcessError::SpawnFailed(format!(
                    "{program}: no executable found"
                ))),
            }
        }

        fn create(&self, spec: LaunchSpec) -> UnixProcessHandle {
            UnixProcessHandle::new(spec)
        }

        fn platform_name(&self) -> &'static str {
            "unix"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use procunit_core::MemorySink;

        fn shell(script: &str, out: &MemorySink, err: &MemorySink) -> UnixProcessHandle {
            UnixLauncher::new().create(LaunchSpec {
                entrypoint: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                env: HashMap::new(),
                working_directory: None,
                stdout: OutputTarget::Sink(out.stdout().into()),
                stderr: OutputTarget::Sink(err.stderr().into()),
            })
        }

        #[tokio::test]
        async fn test_exit_code_and_piped_output() {
            let (out, err) = (MemorySink::new(), MemorySink::new());
            let mut handle = shell("echo out; echo err >&2; exit 4", &out, &err);

            handle.start().await.unwrap();
            assert!(handle.pid().is_some());
            assert_eq!(handle.wait(None).await.unwrap(), Some(4));
            assert!(!handle.alive());
            assert_eq!(handle.exit_code(), Some(4));

            // Forwarding tasks finish shortly after the pipes close
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(out.contents(), "out\n");
            assert_eq!(err.contents(), "err\n");
        }

        #[tokio::test]
        async fn test_start_twice_is_rejected() {
            let (out, err) = (MemorySink::new(), MemorySink::new());
            let mut handle = shell("true", &out, &err);

            handle.start().await.unwrap();
            assert!(matches!(handle.start().await, Err(ProcessError::AlreadyStarted)));
        }

        #[tokio::test]
        async fn test_spawn_errors() {
            let (out, err) = (MemorySink::new(), MemorySink::new());
            let mut handle = UnixLauncher::new().create(LaunchSpec {
                entrypoint: vec!["/definitely/not/a/binary".to_string()],
                env: HashMap::new(),
                working_directory: None,
                stdout: OutputTarget::Sink(out.stdout().into()),
                stderr: OutputTarget::Sink(err.stderr().into()),
            });
            assert!(matches!(handle.start().await, Err(ProcessError::SpawnFailed(_))));
            assert_eq!(handle.pid(), None);

            let mut empty = UnixLauncher::new().create(LaunchSpec {
                entrypoint: Vec::new(),
                env: HashMap::new(),
                working_directory: None,
                stdout: OutputTarget::Sink(out.stdout().into()),
                stderr: OutputTarget::Sink(err.stderr().into()),
            });
            assert!(matches!(empty.start().await, Err(ProcessError::EmptyEntrypoint)));
        }

        #[tokio::test]
        async fn test_wait_times_out_then_force_kill() {
            let (out, err) = (MemorySink::new(), MemorySink::new());
            let mut handle = shell("exec sleep 30", &out, &err);
            handle.start().await.unwrap();

            assert_eq!(handle.wait(Some(Duration::from_millis(100))).await.unwrap(), None);
            assert!(handle.alive());

            let result = handle.terminate(true, Duration::from_secs(5)).await;
            assert_eq!(result, TerminationResult::Success);
            assert_eq!(handle.exit_code(), Some(137));
            assert_eq!(
                handle.terminate(true, Duration::from_secs(5)).await,
                TerminationResult::NotRunning
            );
        }

        #[tokio::test]
        async fn test_unstarted_handle() {
            let (out, err) = (MemorySink::new(), MemorySink::new());
            let mut handle = shell("true", &out, &err);

            assert!(!handle.alive());
            assert_eq!(handle.exit_code(), None);
            assert!(matches!(handle.wait(None).await, Err(ProcessError::NotStarted)));
            assert_eq!(
                handle.terminate(false, Duration::from_secs(1)).await,
                TerminationResult::NotRunning
            );
        }

        #[test]
        fn test_check_entrypoint_resolves_programs() {
            let launcher = UnixLauncher::new();
            let env = HashMap::new();

            assert!(launcher.check_entrypoint(&["sh".to_string()], &env, None).is_ok());
            assert!(
                launcher
                    .check_entrypoint(&["/bin/sh".to_string()], &env, None)
                    .is_ok()
            );
            assert!(matches!(
                launcher.check_entrypoint(&["procunit-no-such-tool".to_string()], &env, None),
                Err(ProcessError::SpawnFailed(_))
            ));
            assert!(matches!(
                launcher.check_entrypoint(&[], &env, None),
                Err(ProcessError::EmptyEntrypoint)
            ));
        }

        #[test]
        fn test_resolve_program_uses_child_path() {
            let dir = std::env::temp_dir().join(format!("procunit-path-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            let tool = dir.join("procunit-tool");
            std::fs::write(&tool, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

            let mut env = HashMap::new();
            assert_eq!(resolve_program("procunit-tool", &env, None), None);

            env.insert("PATH".to_string(), dir.display().to_string());
            assert_eq!(resolve_program("procunit-tool", &env, None), Some(tool.clone()));

            // Relative paths are looked up from the working directory
            assert_eq!(
                resolve_program("./procunit-tool", &HashMap::new(), Some(&dir)),
                Some(dir.join("./procunit-tool"))
            );

            // Not executable
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o644)).unwrap();
            assert_eq!(resolve_program("procunit-tool", &env, None), None);

            let _ = std::fs::remove_dir_all(&dir);
        }

        #[test]
        fn test_platform_name() {
            assert_eq!(UnixLauncher.platform_name(), "unix");
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixLauncher, UnixProcessHandle};
