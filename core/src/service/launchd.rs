use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use super::templates::{self, Quoting};
use super::{
    Program, ServiceDescriptor, ServiceError, ServiceManager, command_error, run_until_signal,
};
use crate::platform::{self, ProcessRunner, ServicePaths};

/// System-wide launch daemon, controlled through `launchctl`.
pub struct Launchd {
    descriptor: ServiceDescriptor,
    paths: Arc<dyn ServicePaths>,
    runner: Arc<dyn ProcessRunner>,
}

impl Launchd {
    pub fn new(
        descriptor: ServiceDescriptor,
        paths: Arc<dyn ServicePaths>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            descriptor,
            paths,
            runner,
        }
    }

    fn plist_path(&self) -> PathBuf {
        self.paths
            .launch_daemon_dir()
            .join(format!("{}.plist", self.descriptor.name))
    }

    fn launchctl(&self, action: &str) -> Result<(), ServiceError> {
        let args = vec![action.to_string(), self.plist_path().to_string_lossy().into_owned()];
        self.runner
            .run("launchctl", &args)
            .map_err(|err| command_error("launchctl", err))
    }
}

impl ServiceManager for Launchd {
    fn platform(&self) -> &'static str {
        "darwin-launchd"
    }

    fn install(&self) -> Result<(), ServiceError> {
        let plist = templates::render(templates::LAUNCHD_PLIST, &self.descriptor, Quoting::Plist);
        let path = self.plist_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, plist)?;
        info!("wrote launch daemon {}", path.display());
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        match fs::remove_file(self.plist_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ServiceError::NotInstalled(self.descriptor.name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.launchctl("load")
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.launchctl("unload")
    }

    fn restart(&self) -> Result<(), ServiceError> {
        self.stop()?;
        self.start()
    }

    fn run(&self, mut program: Box<dyn Program>) -> Result<(), ServiceError> {
        run_until_signal(program.as_mut(), platform::is_interactive())
    }
}
