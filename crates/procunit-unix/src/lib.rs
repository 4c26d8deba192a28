mod unix_process_manager;

#[cfg(unix)]
pub use unix_process_manager::{UnixLauncher, UnixProcessHandle};

#[cfg(unix)]
pub struct UnixLauncherFactory;

#[cfg(unix)]
impl procunit_core::ProcessLauncherFactory for UnixLauncherFactory {
    type Launcher = UnixLauncher;

    fn create_launcher() -> UnixLauncher {
        UnixLauncher::new()
    }
}
