use procunit_core::ProcessLauncherFactory;

/// Platform-independent factory that selects the appropriate launcher at compile time
pub struct PlatformLauncherFactory;

impl ProcessLauncherFactory for PlatformLauncherFactory {
    #[cfg(unix)]
    type Launcher = procunit_unix::UnixLauncher;

    fn create_launcher() -> Self::Launcher {
        #[cfg(unix)]
        return procunit_unix::UnixLauncherFactory::create_launcher();
    }
}

/// Launcher used by [`crate::Container`] on this platform
pub type PlatformLauncher = <PlatformLauncherFactory as ProcessLauncherFactory>::Launcher;
