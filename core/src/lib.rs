pub mod client;
pub mod config;
pub mod mode;
pub mod service;
pub mod supervisor;

/// Interfaces that the shell implements to adapt the core library
/// without pulling in host-specific behaviour.
pub mod platform {
    use std::path::PathBuf;

    /// Runs helper programs (`systemctl`, `launchctl`, init scripts) to completion.
    pub trait ProcessRunner: Send + Sync {
        fn run(
            &self,
            program: &str,
            args: &[String],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    }

    /// Platform-conventional locations of service registration artifacts.
    pub trait ServicePaths: Send + Sync {
        fn systemd_unit_dir(&self) -> PathBuf;
        fn init_script_dir(&self) -> PathBuf;
        fn rc_dir(&self) -> PathBuf;
        fn launch_daemon_dir(&self) -> PathBuf;

        /// Present when the host booted with systemd as PID 1.
        fn systemd_marker(&self) -> PathBuf {
            PathBuf::from("/run/systemd/system")
        }
    }

    /// Whether the process was started from a terminal rather than by a service manager.
    #[cfg(unix)]
    pub fn is_interactive() -> bool {
        // SAFETY: getppid has no preconditions and cannot fail.
        unsafe { libc::getppid() != 1 }
    }

    #[cfg(not(unix))]
    pub fn is_interactive() -> bool {
        true
    }
}
