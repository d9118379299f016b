use std::path::PathBuf;
use std::process::Command;

use log::debug;
use npc_core::platform::{ProcessRunner, ServicePaths};

/// Fixed system locations used by the service back-ends.
#[derive(Default)]
pub struct HostPaths;

impl ServicePaths for HostPaths {
    fn systemd_unit_dir(&self) -> PathBuf {
        PathBuf::from("/etc/systemd/system")
    }

    fn init_script_dir(&self) -> PathBuf {
        PathBuf::from("/etc/init.d")
    }

    fn rc_dir(&self) -> PathBuf {
        PathBuf::from("/etc/rc.d")
    }

    fn launch_daemon_dir(&self) -> PathBuf {
        PathBuf::from("/Library/LaunchDaemons")
    }
}

/// Runs helper programs and fails on a non-zero exit status.
#[derive(Default)]
pub struct HostRunner;

impl ProcessRunner for HostRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        debug!("running {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("exited with {}: {}", output.status, stderr.trim()).into())
    }
}
