//! Platform service adapter.
//! Maps the lifecycle verbs onto whichever service manager the host has,
//! selected once by `detect`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::platform::{ProcessRunner, ServicePaths};

#[cfg(unix)]
mod launchd;
#[cfg(unix)]
mod systemd;
#[cfg(unix)]
mod sysv;
#[cfg(unix)]
mod templates;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use launchd::Launchd;
#[cfg(unix)]
pub use systemd::Systemd;
#[cfg(unix)]
pub use sysv::SysV;
#[cfg(windows)]
pub use windows::WindowsService;

pub const SERVICE_NAME: &str = "Npc";
pub const DISPLAY_NAME: &str = "npc tunnel client";
pub const DESCRIPTION: &str = "Lightweight intranet penetration client: keeps a reverse tunnel to an nps server open for tcp, udp, http and socks5 forwarding.";

/// Appended to every managed command line; a service has no console to log to.
pub const FORCED_DEBUG_OFF: &str = "-debug=false";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service management is not supported on {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} failed: {reason}")]
    Command { program: String, reason: String },
    #[error("service {0} is not installed")]
    NotInstalled(String),
    #[error("signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[cfg(windows)]
    #[error("windows service manager: {0}")]
    Windows(#[from] windows_service::Error),
}

/// Lifecycle verbs directed at the service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
    Restart,
    Install,
    Uninstall,
}

impl Verb {
    pub const ALL: [Verb; 5] = [
        Verb::Start,
        Verb::Stop,
        Verb::Restart,
        Verb::Install,
        Verb::Uninstall,
    ];
    pub const NAMES: [&'static str; 5] = ["start", "stop", "restart", "install", "uninstall"];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Restart => "restart",
            Verb::Install => "install",
            Verb::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|verb| verb.as_str() == s)
            .ok_or_else(|| format!("unknown service action {s:?}"))
    }
}

/// Static metadata registered with the host's service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    /// Startup ordering lines, empty on Windows.
    pub dependencies: Vec<String>,
    pub templates: Option<ScriptTemplates>,
}

/// Script bodies the Unix back-ends render for this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptTemplates {
    pub systemd: &'static str,
    pub sysv: &'static str,
}

impl ServiceDescriptor {
    /// Descriptor for the managed client, re-executing `executable` with the
    /// arguments derived from the current command line (program name excluded).
    pub fn for_client<S: AsRef<str>>(executable: PathBuf, args: &[S]) -> Self {
        let (dependencies, templates) = host_registration();
        Self {
            name: SERVICE_NAME.to_string(),
            display_name: DISPLAY_NAME.to_string(),
            description: DESCRIPTION.to_string(),
            executable,
            arguments: derive_arguments(args),
            dependencies,
            templates,
        }
    }
}

/// Startup ordering and script bodies for the Unix back-ends.
#[cfg(unix)]
fn host_registration() -> (Vec<String>, Option<ScriptTemplates>) {
    (
        vec![
            "Requires=network.target".to_string(),
            "After=network-online.target syslog.target".to_string(),
        ],
        Some(ScriptTemplates {
            systemd: templates::SYSTEMD_UNIT,
            sysv: templates::SYSV_SCRIPT,
        }),
    )
}

#[cfg(not(unix))]
fn host_registration() -> (Vec<String>, Option<ScriptTemplates>) {
    (Vec::new(), None)
}

/// Strip lifecycle verbs and service/debug markers, then force file logging.
pub fn derive_arguments<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    let mut derived: Vec<String> = args
        .iter()
        .map(AsRef::as_ref)
        .filter(|arg| arg.parse::<Verb>().is_err())
        .filter(|arg| !is_mode_marker(arg))
        .map(str::to_string)
        .collect();
    derived.push(FORCED_DEBUG_OFF.to_string());
    derived
}

fn is_mode_marker(arg: &str) -> bool {
    arg.contains("-service=") || arg.contains("-debug=") || matches!(arg, "-debug" | "--debug")
}

/// The long-running side of the service, driven by the service manager.
pub trait Program: Send {
    /// Must return promptly; service managers time out blocking start hooks.
    fn start(&mut self) -> Result<(), ServiceError>;
    /// `interactive` is true when no service manager owns the process.
    fn stop(&mut self, interactive: bool) -> Result<(), ServiceError>;
}

/// One implementation per service manager family.
pub trait ServiceManager: Send + Sync {
    fn platform(&self) -> &'static str;
    fn install(&self) -> Result<(), ServiceError>;
    fn uninstall(&self) -> Result<(), ServiceError>;
    fn start(&self) -> Result<(), ServiceError>;
    fn stop(&self) -> Result<(), ServiceError>;
    fn restart(&self) -> Result<(), ServiceError>;

    /// Extra registration work once the service is installed and started.
    fn after_install(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Extra cleanup after deregistration.
    fn after_uninstall(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Hand the process over to the service manager until it asks us to stop.
    fn run(&self, program: Box<dyn Program>) -> Result<(), ServiceError>;
}

/// Pick the service manager for this host.
pub fn detect(
    descriptor: ServiceDescriptor,
    paths: Arc<dyn ServicePaths>,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Box<dyn ServiceManager>, ServiceError> {
    detect_for_host(descriptor, paths, runner)
}

#[cfg(windows)]
fn detect_for_host(
    descriptor: ServiceDescriptor,
    _paths: Arc<dyn ServicePaths>,
    _runner: Arc<dyn ProcessRunner>,
) -> Result<Box<dyn ServiceManager>, ServiceError> {
    Ok(Box::new(WindowsService::new(descriptor)))
}

#[cfg(target_os = "macos")]
fn detect_for_host(
    descriptor: ServiceDescriptor,
    paths: Arc<dyn ServicePaths>,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Box<dyn ServiceManager>, ServiceError> {
    Ok(Box::new(Launchd::new(descriptor, paths, runner)))
}

#[cfg(all(unix, not(target_os = "macos")))]
fn detect_for_host(
    descriptor: ServiceDescriptor,
    paths: Arc<dyn ServicePaths>,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Box<dyn ServiceManager>, ServiceError> {
    if paths.systemd_marker().exists() {
        return Ok(Box::new(Systemd::new(descriptor, paths, runner)));
    }
    if paths.init_script_dir().is_dir() {
        return Ok(Box::new(SysV::new(descriptor, paths, runner)));
    }
    Err(unsupported_host())
}

#[cfg(not(any(unix, windows)))]
fn detect_for_host(
    _descriptor: ServiceDescriptor,
    _paths: Arc<dyn ServicePaths>,
    _runner: Arc<dyn ProcessRunner>,
) -> Result<Box<dyn ServiceManager>, ServiceError> {
    Err(unsupported_host())
}

#[cfg(not(any(windows, target_os = "macos")))]
fn unsupported_host() -> ServiceError {
    ServiceError::Unsupported(format!(
        "{}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    ))
}

/// Applies lifecycle verbs with the registration policy shared by every platform.
pub struct ServiceAdapter {
    manager: Box<dyn ServiceManager>,
}

impl ServiceAdapter {
    pub fn new(manager: Box<dyn ServiceManager>) -> Self {
        Self { manager }
    }

    pub fn platform(&self) -> &'static str {
        self.manager.platform()
    }

    /// Run a verb. Failures are logged and never abort the caller.
    pub fn control(&self, verb: Verb) {
        info!("{} service: {}", self.manager.platform(), verb);
        if let Err(err) = self.apply(verb) {
            error!("Valid actions: {:?}\n{}", Verb::NAMES, err);
        }
    }

    /// `install` with a staging step run once the previous registration is
    /// gone. `stage` may return the manager to register instead, e.g. one
    /// whose descriptor points at a freshly copied binary.
    pub fn install_with(&self, stage: impl FnOnce() -> Option<Box<dyn ServiceManager>>) {
        info!("{} service: {}", self.manager.platform(), Verb::Install);
        if let Err(err) = self.install_staged(stage) {
            error!("Valid actions: {:?}\n{}", Verb::NAMES, err);
        }
    }

    fn install_staged(
        &self,
        stage: impl FnOnce() -> Option<Box<dyn ServiceManager>>,
    ) -> Result<(), ServiceError> {
        // A previous registration may or may not exist.
        if let Err(err) = self.manager.stop() {
            debug!("stop before install: {}", err);
        }
        if let Err(err) = self.manager.uninstall() {
            debug!("uninstall before install: {}", err);
        }
        let staged = stage();
        let manager = staged.as_deref().unwrap_or(self.manager.as_ref());
        manager.install()?;
        let started = manager.start();
        manager.after_install()?;
        started
    }

    fn apply(&self, verb: Verb) -> Result<(), ServiceError> {
        match verb {
            Verb::Install => self.install_staged(|| None),
            Verb::Uninstall => {
                let removed = self.manager.uninstall();
                self.manager.after_uninstall()?;
                removed
            }
            Verb::Start => self.manager.start(),
            Verb::Stop => self.manager.stop(),
            Verb::Restart => self.manager.restart(),
        }
    }

    pub fn run(&self, program: Box<dyn Program>) -> Result<(), ServiceError> {
        self.manager.run(program)
    }
}

/// Start the program and block until SIGINT/SIGTERM, then stop it.
pub(crate) fn run_until_signal(
    program: &mut dyn Program,
    interactive: bool,
) -> Result<(), ServiceError> {
    program.start()?;
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();
    info!("termination signal received");
    program.stop(interactive)
}

/// No service framework available: run in the foreground and never return.
pub fn run_foreground(program: &mut dyn Program) -> ! {
    if let Err(err) = program.start() {
        warn!("failed to start in the foreground: {}", err);
    }
    loop {
        std::thread::park();
    }
}

#[cfg(unix)]
pub(crate) fn command_error(
    program: &str,
    err: Box<dyn std::error::Error + Send + Sync>,
) -> ServiceError {
    ServiceError::Command {
        program: program.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    /// Records every call and fails the ones it is told to.
    #[derive(Default)]
    pub(crate) struct RecordingManager {
        pub calls: Arc<Mutex<Vec<&'static str>>>,
        pub failing: Vec<&'static str>,
    }

    impl RecordingManager {
        fn record(&self, call: &'static str) -> Result<(), ServiceError> {
            self.calls.lock().unwrap().push(call);
            if self.failing.contains(&call) {
                Err(ServiceError::NotInstalled(SERVICE_NAME.to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl ServiceManager for RecordingManager {
        fn platform(&self) -> &'static str {
            "test"
        }
        fn install(&self) -> Result<(), ServiceError> {
            self.record("install")
        }
        fn uninstall(&self) -> Result<(), ServiceError> {
            self.record("uninstall")
        }
        fn start(&self) -> Result<(), ServiceError> {
            self.record("start")
        }
        fn stop(&self) -> Result<(), ServiceError> {
            self.record("stop")
        }
        fn restart(&self) -> Result<(), ServiceError> {
            self.record("restart")
        }
        fn after_install(&self) -> Result<(), ServiceError> {
            self.record("after_install")
        }
        fn after_uninstall(&self) -> Result<(), ServiceError> {
            self.record("after_uninstall")
        }
        fn run(&self, _program: Box<dyn Program>) -> Result<(), ServiceError> {
            self.record("run")
        }
    }

    /// Records helper invocations as `program arg...` lines.
    #[derive(Default)]
    pub(crate) struct RecordingRunner {
        pub invocations: Mutex<Vec<String>>,
    }

    impl ProcessRunner for RecordingRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let mut line = program.to_string();
            for arg in args {
                line.push(' ');
                line.push_str(arg);
            }
            self.invocations.lock().unwrap().push(line);
            Ok(())
        }
    }

    /// Every artifact directory rooted under one temporary directory.
    pub(crate) struct TempPaths {
        pub root: PathBuf,
    }

    impl TempPaths {
        pub fn new(root: &Path) -> Self {
            for dir in ["systemd", "init.d", "rc.d", "LaunchDaemons"] {
                std::fs::create_dir_all(root.join(dir)).unwrap();
            }
            Self {
                root: root.to_path_buf(),
            }
        }
    }

    impl ServicePaths for TempPaths {
        fn systemd_unit_dir(&self) -> PathBuf {
            self.root.join("systemd")
        }
        fn init_script_dir(&self) -> PathBuf {
            self.root.join("init.d")
        }
        fn rc_dir(&self) -> PathBuf {
            self.root.join("rc.d")
        }
        fn launch_daemon_dir(&self) -> PathBuf {
            self.root.join("LaunchDaemons")
        }
        fn systemd_marker(&self) -> PathBuf {
            self.root.join("run-systemd")
        }
    }

    pub(crate) fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::for_client(
            PathBuf::from("/usr/bin/npc"),
            &["install", "-server=1.2.3.4:8024", "-vkey=abc123"],
        )
    }

    fn adapter_with(
        failing: Vec<&'static str>,
    ) -> (ServiceAdapter, Arc<Mutex<Vec<&'static str>>>) {
        let manager = RecordingManager {
            failing,
            ..Default::default()
        };
        let calls = manager.calls.clone();
        (ServiceAdapter::new(Box::new(manager)), calls)
    }

    #[test]
    fn derivation_strips_verbs_and_markers() {
        let args = [
            "install",
            "-server=1.2.3.4:8024",
            "-service=Npc",
            "-debug=true",
            "-vkey=abc",
            "restart",
        ];
        assert_eq!(
            derive_arguments(&args),
            vec!["-server=1.2.3.4:8024", "-vkey=abc", FORCED_DEBUG_OFF]
        );
    }

    #[test]
    fn derivation_always_ends_with_single_debug_off() {
        let pool = [
            "install",
            "uninstall",
            "start",
            "stop",
            "restart",
            "-debug=false",
            "--debug=true",
            "-debug",
            "-service=install",
            "-server=a:1",
            "-config=/etc/npc.toml",
        ];
        // every subset of the pool, in order
        for mask in 0u32..(1 << pool.len()) {
            let args: Vec<&str> = pool
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, arg)| *arg)
                .collect();
            let derived = derive_arguments(&args);
            assert_eq!(derived.last().map(String::as_str), Some(FORCED_DEBUG_OFF));
            assert_eq!(
                derived.iter().filter(|a| a.contains("-debug")).count(),
                1,
                "input {:?}",
                args
            );
            for verb in Verb::NAMES {
                assert!(!derived.iter().any(|a| a == verb), "input {:?}", args);
            }
            assert!(!derived.iter().any(|a| a.contains("-service=")));
        }
    }

    #[test]
    fn verbs_round_trip_through_names() {
        for (verb, name) in Verb::ALL.into_iter().zip(Verb::NAMES) {
            assert_eq!(verb.as_str(), name);
            assert_eq!(name.parse::<Verb>(), Ok(verb));
        }
        assert!("status".parse::<Verb>().is_err());
    }

    #[test]
    fn install_clears_previous_registration_first() {
        let (adapter, calls) = adapter_with(vec![]);
        adapter.control(Verb::Install);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["stop", "uninstall", "install", "start", "after_install"]
        );
    }

    #[test]
    fn install_tolerates_missing_previous_registration() {
        let (adapter, calls) = adapter_with(vec!["stop", "uninstall"]);
        adapter.control(Verb::Install);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["stop", "uninstall", "install", "start", "after_install"]
        );
    }

    #[test]
    fn staging_runs_between_uninstall_and_install() {
        let (adapter, calls) = adapter_with(vec![]);
        let staged_calls = calls.clone();
        adapter.install_with(move || {
            staged_calls.lock().unwrap().push("copy binary");
            let manager: Box<dyn ServiceManager> = Box::new(RecordingManager {
                calls: staged_calls,
                failing: vec![],
            });
            Some(manager)
        });
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "stop",
                "uninstall",
                "copy binary",
                "install",
                "start",
                "after_install"
            ]
        );
    }

    #[test]
    fn staging_without_replacement_uses_detected_manager() {
        let (adapter, calls) = adapter_with(vec!["stop", "uninstall"]);
        adapter.install_with(|| None);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["stop", "uninstall", "install", "start", "after_install"]
        );
    }

    #[test]
    fn failed_install_skips_start() {
        let (adapter, calls) = adapter_with(vec!["install"]);
        adapter.control(Verb::Install);
        assert_eq!(*calls.lock().unwrap(), vec!["stop", "uninstall", "install"]);
    }

    #[test]
    fn uninstall_cleans_up_even_when_deregistration_fails() {
        let (adapter, calls) = adapter_with(vec!["uninstall"]);
        adapter.control(Verb::Uninstall);
        assert_eq!(*calls.lock().unwrap(), vec!["uninstall", "after_uninstall"]);
    }

    #[test]
    fn control_verbs_map_one_to_one() {
        let (adapter, calls) = adapter_with(vec!["restart"]);
        adapter.control(Verb::Start);
        adapter.control(Verb::Stop);
        adapter.control(Verb::Restart);
        assert_eq!(*calls.lock().unwrap(), vec!["start", "stop", "restart"]);
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn detect_prefers_systemd_then_sysv() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(TempPaths::new(dir.path()));
        let runner = Arc::new(RecordingRunner::default());

        let manager = detect(descriptor(), paths.clone(), runner.clone()).unwrap();
        assert_eq!(manager.platform(), "unix-systemv");

        std::fs::create_dir_all(paths.systemd_marker()).unwrap();
        let manager = detect(descriptor(), paths.clone(), runner.clone()).unwrap();
        assert_eq!(manager.platform(), "linux-systemd");

        std::fs::remove_dir_all(paths.systemd_marker()).unwrap();
        std::fs::remove_dir_all(paths.init_script_dir()).unwrap();
        assert!(matches!(
            detect(descriptor(), paths, runner),
            Err(ServiceError::Unsupported(_))
        ));
    }

    /// Reports `start`/`stop` calls over a channel.
    struct ReportingProgram(std::sync::mpsc::Sender<&'static str>);

    impl Program for ReportingProgram {
        fn start(&mut self) -> Result<(), ServiceError> {
            let _ = self.0.send("start");
            Ok(())
        }
        fn stop(&mut self, _interactive: bool) -> Result<(), ServiceError> {
            let _ = self.0.send("stop");
            Ok(())
        }
    }

    #[test]
    fn foreground_run_starts_program_and_keeps_blocking() {
        let (tx, rx) = std::sync::mpsc::channel();
        let task = std::thread::spawn(move || {
            let mut program = ReportingProgram(tx);
            run_foreground(&mut program);
        });

        assert_eq!(
            rx.recv_timeout(std::time::Duration::from_secs(5)),
            Ok("start")
        );
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!task.is_finished());
        assert!(rx.try_recv().is_err(), "program must not be stopped");
    }

    #[test]
    fn descriptor_carries_derived_arguments() {
        let descriptor = descriptor();
        assert_eq!(descriptor.name, SERVICE_NAME);
        assert_eq!(
            descriptor.arguments,
            vec!["-server=1.2.3.4:8024", "-vkey=abc123", FORCED_DEBUG_OFF]
        );
        if cfg!(unix) {
            assert_eq!(descriptor.dependencies.len(), 2);
            assert!(descriptor.templates.is_some());
        } else {
            assert!(descriptor.dependencies.is_empty());
            assert!(descriptor.templates.is_none());
        }
    }
}
