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

/// Unit file in the systemd unit directory, controlled through `systemctl`.
pub struct Systemd {
    descriptor: ServiceDescriptor,
    paths: Arc<dyn ServicePaths>,
    runner: Arc<dyn ProcessRunner>,
}

impl Systemd {
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

    fn unit_name(&self) -> String {
        format!("{}.service", self.descriptor.name)
    }

    fn unit_path(&self) -> PathBuf {
        self.paths.systemd_unit_dir().join(self.unit_name())
    }

    fn systemctl(&self, args: &[&str]) -> Result<(), ServiceError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner
            .run("systemctl", &args)
            .map_err(|err| command_error("systemctl", err))
    }
}

impl ServiceManager for Systemd {
    fn platform(&self) -> &'static str {
        "linux-systemd"
    }

    fn install(&self) -> Result<(), ServiceError> {
        let template = self
            .descriptor
            .templates
            .map(|t| t.systemd)
            .unwrap_or(templates::SYSTEMD_UNIT);
        let unit = templates::render(template, &self.descriptor, Quoting::Systemd);
        let path = self.unit_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, unit)?;
        info!("wrote systemd unit {}", path.display());

        self.systemctl(&["enable", &self.unit_name()])?;
        self.systemctl(&["daemon-reload"])
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        let path = self.unit_path();
        if !path.exists() {
            return Err(ServiceError::NotInstalled(self.descriptor.name.clone()));
        }
        self.systemctl(&["disable", &self.unit_name()])?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.systemctl(&["daemon-reload"])
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.systemctl(&["start", &self.unit_name()])
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.systemctl(&["stop", &self.unit_name()])
    }

    fn restart(&self) -> Result<(), ServiceError> {
        self.systemctl(&["restart", &self.unit_name()])
    }

    fn run(&self, mut program: Box<dyn Program>) -> Result<(), ServiceError> {
        run_until_signal(program.as_mut(), platform::is_interactive())
    }
}
