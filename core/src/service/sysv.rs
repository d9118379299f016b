use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use super::templates::{self, Quoting};
use super::{
    Program, ServiceDescriptor, ServiceError, ServiceManager, command_error, run_until_signal,
};
use crate::platform::{self, ProcessRunner, ServicePaths};

/// Init script in `/etc/init.d`, for hosts without systemd (OpenWrt, BusyBox).
///
/// Every control verb runs the script itself. The host does not derive boot
/// ordering from the script header, so installation also links the script
/// into the rc directory as `S90<name>` and `K02<name>`.
pub struct SysV {
    descriptor: ServiceDescriptor,
    paths: Arc<dyn ServicePaths>,
    runner: Arc<dyn ProcessRunner>,
}

impl SysV {
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

    pub fn script_path(&self) -> PathBuf {
        self.paths.init_script_dir().join(&self.descriptor.name)
    }

    /// The two rc links, start link first.
    pub fn order_links(&self) -> [PathBuf; 2] {
        let rc = self.paths.rc_dir();
        [
            rc.join(format!("S90{}", self.descriptor.name)),
            rc.join(format!("K02{}", self.descriptor.name)),
        ]
    }

    fn invoke(&self, verb: &str) -> Result<(), ServiceError> {
        let script = self.script_path();
        let program = script.to_string_lossy();
        info!("unix-systemv service: {} {}", program, verb);
        self.runner
            .run(&program, &[verb.to_string()])
            .map_err(|err| command_error(&program, err))
    }
}

fn remove_if_present(path: &Path) -> Result<(), ServiceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl ServiceManager for SysV {
    fn platform(&self) -> &'static str {
        "unix-systemv"
    }

    fn install(&self) -> Result<(), ServiceError> {
        let template = self
            .descriptor
            .templates
            .map(|t| t.sysv)
            .unwrap_or(templates::SYSV_SCRIPT);
        let script = templates::render(template, &self.descriptor, Quoting::Shell);
        let path = self.script_path();
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        info!("wrote init script {}", path.display());
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        match fs::remove_file(self.script_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ServiceError::NotInstalled(self.descriptor.name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.invoke("start")
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.invoke("stop")
    }

    fn restart(&self) -> Result<(), ServiceError> {
        self.invoke("restart")
    }

    fn after_install(&self) -> Result<(), ServiceError> {
        let script = self.script_path();
        fs::create_dir_all(self.paths.rc_dir())?;
        for link in self.order_links() {
            remove_if_present(&link)?;
            std::os::unix::fs::symlink(&script, &link)?;
            info!("linked {} -> {}", link.display(), script.display());
        }
        Ok(())
    }

    fn after_uninstall(&self) -> Result<(), ServiceError> {
        for link in self.order_links() {
            remove_if_present(&link)?;
        }
        Ok(())
    }

    fn run(&self, mut program: Box<dyn Program>) -> Result<(), ServiceError> {
        run_until_signal(program.as_mut(), platform::is_interactive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::{RecordingRunner, TempPaths, descriptor};
    use crate::service::{ServiceAdapter, Verb};

    fn setup() -> (tempfile::TempDir, Arc<TempPaths>, Arc<RecordingRunner>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(TempPaths::new(dir.path()));
        (dir, paths, Arc::new(RecordingRunner::default()))
    }

    fn rc_entries(paths: &TempPaths) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(paths.rc_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn every_verb_goes_through_the_init_script() {
        let (_dir, paths, runner) = setup();
        let adapter = ServiceAdapter::new(Box::new(SysV::new(
            descriptor(),
            paths.clone(),
            runner.clone(),
        )));
        let script = paths.init_script_dir().join("Npc");
        let script = script.to_string_lossy();

        for verb in Verb::ALL {
            adapter.control(verb);
        }

        let calls = runner.invocations.lock().unwrap();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|line| line.starts_with(script.as_ref())));
        assert_eq!(
            *calls,
            vec![
                format!("{script} start"),
                format!("{script} stop"),
                format!("{script} restart"),
                // install: stop, (uninstall), install, start
                format!("{script} stop"),
                format!("{script} start"),
            ]
        );
    }

    #[test]
    fn install_writes_executable_script_and_two_links() {
        let (_dir, paths, runner) = setup();
        let adapter = ServiceAdapter::new(Box::new(SysV::new(
            descriptor(),
            paths.clone(),
            runner,
        )));

        adapter.control(Verb::Install);

        let script = paths.init_script_dir().join("Npc");
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let body = fs::read_to_string(&script).unwrap();
        assert!(body.contains("/usr/bin/npc -server=1.2.3.4:8024 -vkey=abc123 -debug=false"));

        assert_eq!(rc_entries(&paths), vec!["K02Npc", "S90Npc"]);
        for name in ["K02Npc", "S90Npc"] {
            assert_eq!(fs::read_link(paths.rc_dir().join(name)).unwrap(), script);
        }
    }

    #[test]
    fn reinstall_replaces_links() {
        let (_dir, paths, runner) = setup();
        let adapter = ServiceAdapter::new(Box::new(SysV::new(
            descriptor(),
            paths.clone(),
            runner,
        )));

        adapter.control(Verb::Install);
        adapter.control(Verb::Install);

        assert_eq!(rc_entries(&paths), vec!["K02Npc", "S90Npc"]);
    }

    #[test]
    fn uninstall_removes_exactly_the_two_links() {
        let (_dir, paths, runner) = setup();
        let adapter = ServiceAdapter::new(Box::new(SysV::new(
            descriptor(),
            paths.clone(),
            runner,
        )));
        adapter.control(Verb::Install);
        fs::write(paths.rc_dir().join("S10network"), "").unwrap();

        adapter.control(Verb::Uninstall);

        assert_eq!(rc_entries(&paths), vec!["S10network"]);
        assert!(!paths.init_script_dir().join("Npc").exists());
    }
}
