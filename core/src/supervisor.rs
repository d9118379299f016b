//! Supervisor for the client's main task.
//! Runs the selected mode on a background thread behind a panic boundary and
//! parks that thread on a single-fire exit signal until the service stops.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Once, PoisonError};
use std::thread::{self, JoinHandle};

use log::{error, warn};

use crate::client::TunnelClient;
use crate::config::RuntimeConfig;
use crate::mode::{self, RunMode};
use crate::service::{Program, ServiceError};

/// Upper bound on the stack trace kept for a caught panic.
pub const MAX_TRACE_BYTES: usize = 64 << 10;

/// One-shot stop notification shared between the service hooks and the task.
#[derive(Clone, Default)]
pub struct ExitSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        let (fired, cvar) = &*self.inner;
        let mut fired = fired.lock().unwrap_or_else(PoisonError::into_inner);
        if *fired {
            return false;
        }
        *fired = true;
        cvar.notify_all();
        true
    }

    pub fn is_fired(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        let (fired, cvar) = &*self.inner;
        let guard = fired.lock().unwrap_or_else(PoisonError::into_inner);
        let _fired = cvar
            .wait_while(guard, |fired| !*fired)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Block for at most `timeout`; returns whether the signal fired.
    #[cfg(test)]
    pub(crate) fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let (fired, cvar) = &*self.inner;
        let guard = fired.lock().unwrap_or_else(PoisonError::into_inner);
        let (fired, _) = cvar
            .wait_timeout_while(guard, timeout, |fired| !*fired)
            .unwrap_or_else(PoisonError::into_inner);
        *fired
    }
}

/// A panic caught by [`guard`].
#[derive(Debug, Clone)]
pub struct Fault {
    pub label: String,
    pub message: String,
    pub trace: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: panic serving {}", self.label, self.message)
    }
}

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Panics inside a guard record a trace for the guard instead of printing;
/// all other panics go to the previous hook.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(Cell::get) > 0 {
                let trace = truncate_trace(Backtrace::force_capture().to_string());
                LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

fn truncate_trace(mut trace: String) -> String {
    if trace.len() > MAX_TRACE_BYTES {
        let mut end = MAX_TRACE_BYTES;
        while !trace.is_char_boundary(end) {
            end -= 1;
        }
        trace.truncate(end);
    }
    trace
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `f`, converting a panic into a logged [`Fault`].
pub fn guard<T>(label: &str, f: impl FnOnce() -> T) -> Result<T, Fault> {
    install_hook();
    GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    GUARD_DEPTH.with(|depth| depth.set(depth.get() - 1));

    outcome.map_err(|payload| {
        let fault = Fault {
            label: label.to_string(),
            message: panic_message(payload.as_ref()),
            trace: LAST_TRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_default(),
        };
        warn!("{}\n{}", fault, fault.trace);
        fault
    })
}

/// Spawn the background task: run `body` behind the guard, then wait for `exit`.
/// The body is never restarted.
pub fn spawn_supervised(
    exit: ExitSignal,
    body: impl FnOnce() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("npc-supervisor".to_string())
        .spawn(move || {
            let _ = guard("npc", body);
            exit.wait();
            warn!("stop...");
        })
}

/// Exit signal plus the task observing it.
pub struct SupervisorHandle {
    exit: ExitSignal,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[cfg(test)]
    pub(crate) fn join(self) -> thread::Result<()> {
        self.task.join()
    }
}

/// Owns the background task for the selected run mode.
pub struct Supervisor {
    config: Arc<RuntimeConfig>,
    client: Arc<dyn TunnelClient>,
    handle: Option<SupervisorHandle>,
}

impl Supervisor {
    pub fn new(config: Arc<RuntimeConfig>, client: Arc<dyn TunnelClient>) -> Self {
        Self {
            config,
            client,
            handle: None,
        }
    }

    pub fn handle(&self) -> Option<&SupervisorHandle> {
        self.handle.as_ref()
    }

    pub fn take_handle(&mut self) -> Option<SupervisorHandle> {
        self.handle.take()
    }
}

impl Program for Supervisor {
    fn start(&mut self) -> Result<(), ServiceError> {
        if self.handle.is_some() {
            return Ok(());
        }
        if let Some(addr) = &self.config.pprof_addr {
            warn!("profiling endpoint {} is not available in this build", addr);
        }

        let exit = ExitSignal::new();
        let config = self.config.clone();
        let client = self.client.clone();
        let task = spawn_supervised(exit.clone(), move || {
            let run_mode = RunMode::select(&config);
            if let Err(err) = mode::launch(run_mode, client) {
                error!("failed to spawn the client task: {}", err);
            }
        })?;
        self.handle = Some(SupervisorHandle { exit, task });
        Ok(())
    }

    fn stop(&mut self, interactive: bool) -> Result<(), ServiceError> {
        if let Some(handle) = &self.handle {
            handle.exit.fire();
        }
        if interactive {
            std::process::exit(0);
        }
        Ok(())
    }
}
