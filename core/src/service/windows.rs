use std::ffi::{OsStr, OsString};
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info};
use windows_service::service::{
    ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
    ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::service_manager::{ServiceManager as Scm, ServiceManagerAccess};
use windows_service::{define_windows_service, service_dispatcher};

use super::{Program, ServiceDescriptor, ServiceError, ServiceManager, run_until_signal};

/// ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: not launched by the SCM.
const NOT_UNDER_SCM: i32 = 1063;

static PROGRAM: Mutex<Option<Box<dyn Program>>> = Mutex::new(None);
static NAME: OnceLock<String> = OnceLock::new();

define_windows_service!(ffi_service_main, service_main);

/// Native Service Control Manager registration.
pub struct WindowsService {
    descriptor: ServiceDescriptor,
}

impl WindowsService {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self { descriptor }
    }

    fn open(
        &self,
        access: ServiceAccess,
    ) -> Result<windows_service::service::Service, ServiceError> {
        let manager = Scm::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)?;
        Ok(manager.open_service(&self.descriptor.name, access)?)
    }
}

impl ServiceManager for WindowsService {
    fn platform(&self) -> &'static str {
        "windows-service"
    }

    fn install(&self) -> Result<(), ServiceError> {
        let manager = Scm::local_computer(
            None::<&str>,
            ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
        )?;
        let info = ServiceInfo {
            name: OsString::from(&self.descriptor.name),
            display_name: OsString::from(&self.descriptor.display_name),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: self.descriptor.executable.clone(),
            launch_arguments: self.descriptor.arguments.iter().map(OsString::from).collect(),
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        let service = manager.create_service(&info, ServiceAccess::CHANGE_CONFIG)?;
        service.set_description(&self.descriptor.description)?;
        info!("registered service {}", self.descriptor.name);
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        self.open(ServiceAccess::DELETE)?.delete()?;
        Ok(())
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.open(ServiceAccess::START)?.start(&[] as &[&OsStr])?;
        Ok(())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.open(ServiceAccess::STOP)?.stop()?;
        Ok(())
    }

    fn restart(&self) -> Result<(), ServiceError> {
        let service =
            self.open(ServiceAccess::STOP | ServiceAccess::START | ServiceAccess::QUERY_STATUS)?;
        if service.query_status()?.current_state != ServiceState::Stopped {
            service.stop()?;
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while service.query_status()?.current_state != ServiceState::Stopped {
            if Instant::now() > deadline {
                break;
            }
            thread::sleep(Duration::from_millis(250));
        }
        service.start(&[] as &[&OsStr])?;
        Ok(())
    }

    fn run(&self, program: Box<dyn Program>) -> Result<(), ServiceError> {
        *PROGRAM.lock().unwrap_or_else(PoisonError::into_inner) = Some(program);
        let _ = NAME.set(self.descriptor.name.clone());
        match service_dispatcher::start(&self.descriptor.name, ffi_service_main) {
            Ok(()) => Ok(()),
            Err(windows_service::Error::Winapi(err))
                if err.raw_os_error() == Some(NOT_UNDER_SCM) =>
            {
                let mut program = take_program()?;
                run_until_signal(program.as_mut(), true)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn take_program() -> Result<Box<dyn Program>, ServiceError> {
    PROGRAM
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or_else(|| ServiceError::Unsupported("service program already taken".to_string()))
}

fn service_main(_arguments: Vec<OsString>) {
    if let Err(err) = run_dispatched() {
        error!("service stopped with error: {}", err);
    }
}

fn status(state: ServiceState, controls: ServiceControlAccept) -> ServiceStatus {
    ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: state,
        controls_accepted: controls,
        exit_code: ServiceExitCode::Win32(0),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    }
}

fn run_dispatched() -> Result<(), ServiceError> {
    let name = NAME.get().cloned().unwrap_or_default();
    let (tx, rx) = mpsc::channel();
    let handle = service_control_handler::register(&name, move |event| match event {
        ServiceControl::Stop | ServiceControl::Shutdown => {
            let _ = tx.send(());
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
        _ => ServiceControlHandlerResult::NotImplemented,
    })?;

    let mut program = take_program()?;
    program.start()?;
    handle.set_service_status(status(
        ServiceState::Running,
        ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
    ))?;

    let _ = rx.recv();
    handle.set_service_status(status(
        ServiceState::StopPending,
        ServiceControlAccept::empty(),
    ))?;
    let stopped = program.stop(false);
    handle.set_service_status(status(
        ServiceState::Stopped,
        ServiceControlAccept::empty(),
    ))?;
    stopped
}
