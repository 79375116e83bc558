//! The event loop and the application hooks it drives.
//!
//! A [`Runtime`] owns the descriptor and task tables, the signal bridge and
//! the application configuration. It is single-threaded: handlers, tasks
//! and hooks all run on the thread that called [`Runtime::run`] and receive
//! `&Runtime`, through which they can register more work or request
//! termination. Tables live behind `RefCell`s and are never borrowed while
//! application code runs.

use std::cell::{Ref, RefCell, RefMut};
use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{PollFlags, PollTimeout};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::daemonize::daemonize;
use crate::error::{HookError, LoopPhase, RuntimeError};
use crate::pid::PidFile;
use crate::reactor::{Event, HandlerId, HandlerTable, Interest};
use crate::scheduler::{TaskStatus, TaskTable};
use crate::signal::{DaemonSignal, SignalBridge};

type HandlerFn<H> = Box<dyn FnMut(&Runtime<H>, &mut Event) -> io::Result<()>>;
type TaskFn<H> = Box<dyn FnMut(&Runtime<H>, u32) -> TaskStatus>;

/// Application callbacks invoked by the runtime.
///
/// Every method has a default body, so an application only implements the
/// hooks it needs.
pub trait Hooks: Sized + 'static {
    /// Application configuration, produced by [`Hooks::parse_config`].
    type Config: 'static;
    /// Application state, owned by the runtime for its whole lifetime.
    type State: 'static;

    /// Called once, after daemonization and the initial configuration load,
    /// before the loop starts. An error aborts startup; `cleanup` still runs.
    fn initialize(&self, _rt: &Runtime<Self>) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once per decoded signal, in normal execution context.
    fn signal_handler(&self, _rt: &Runtime<Self>, signal: DaemonSignal) {
        debug!("Ignoring {} signal", signal);
    }

    /// Called whenever a readiness wait times out without events.
    fn idle_handler(&self, _rt: &Runtime<Self>) {}

    /// Called exactly once at shutdown. Failures are logged only.
    fn cleanup(&self, _rt: &Runtime<Self>) -> Result<(), HookError> {
        Ok(())
    }

    /// Parse the configuration file at startup and on every reload.
    ///
    /// `previous` is the configuration currently in use, if any. Returning
    /// an error or `Ok(None)` keeps the current configuration.
    fn parse_config(
        &self,
        _path: &Path,
        _previous: Option<&Self::Config>,
    ) -> Result<Option<Self::Config>, HookError> {
        Ok(None)
    }

    /// Release a configuration that was superseded or is dropped at shutdown.
    fn config_cleanup(&self, config: Self::Config) {
        drop(config);
    }
}

/// Single-threaded daemon runtime.
pub struct Runtime<H: Hooks> {
    config: RuntimeConfig,
    hooks: H,
    state: RefCell<H::State>,
    app_config: RefCell<Option<Rc<H::Config>>>,
    handlers: RefCell<HandlerTable<HandlerFn<H>>>,
    tasks: RefCell<TaskTable<TaskFn<H>>>,
    bridge: RefCell<Option<SignalBridge>>,
    pid_file: RefCell<Option<PidFile>>,
    running: AtomicBool,
    phase: AtomicU8,
}

impl<H: Hooks> Runtime<H> {
    /// Create a runtime. Nothing is installed until [`Runtime::run`].
    pub fn new(config: RuntimeConfig, hooks: H, state: H::State) -> Result<Self, RuntimeError> {
        config.validate().map_err(RuntimeError::Config)?;

        Ok(Self {
            handlers: RefCell::new(HandlerTable::new(config.handler_capacity)),
            tasks: RefCell::new(TaskTable::new(config.task_capacity)),
            config,
            hooks,
            state: RefCell::new(state),
            app_config: RefCell::new(None),
            bridge: RefCell::new(None),
            pid_file: RefCell::new(None),
            running: AtomicBool::new(false),
            phase: AtomicU8::new(LoopPhase::NotStarted as u8),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Borrow the application state.
    ///
    /// Panics if the state is mutably borrowed; do not hold the guard across
    /// calls that may re-enter application code.
    pub fn state(&self) -> Ref<'_, H::State> {
        self.state.borrow()
    }

    /// Mutably borrow the application state.
    pub fn state_mut(&self) -> RefMut<'_, H::State> {
        self.state.borrow_mut()
    }

    /// The configuration currently in use, if one was loaded.
    ///
    /// The returned reference stays valid across reloads; the superseded
    /// configuration is released once the last reference is dropped.
    pub fn app_config(&self) -> Option<Rc<H::Config>> {
        self.app_config.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> LoopPhase {
        LoopPhase::from(self.phase.load(Ordering::SeqCst))
    }

    /// Number of live descriptor registrations, including the signal bridge.
    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Number of scheduled tasks, including ones currently executing.
    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Watch `fd` for `interest` and call `callback` whenever it is ready.
    ///
    /// The descriptor must stay open until the registration is removed. It
    /// remains owned by the caller, with one exception: when the callback
    /// returns an error, the runtime closes the descriptor and frees the
    /// slot. Callbacks that own their descriptor should unregister
    /// themselves and return `Ok` instead.
    pub fn register_handler<F>(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: F,
    ) -> Result<HandlerId, RuntimeError>
    where
        F: FnMut(&Runtime<H>, &mut Event) -> io::Result<()> + 'static,
    {
        self.handlers
            .borrow_mut()
            .register(fd, interest, Box::new(callback))
    }

    /// Remove a registration, returning its descriptor. Does not close it.
    pub fn unregister_handler(&self, id: HandlerId) -> Result<RawFd, RuntimeError> {
        self.handlers.borrow_mut().unregister(id)
    }

    /// Current interest mask of a live registration.
    pub fn interest(&self, id: HandlerId) -> Option<Interest> {
        self.handlers.borrow().interest(id)
    }

    /// Change the interest mask of a registration.
    pub fn set_interest(&self, id: HandlerId, interest: Interest) -> Result<(), RuntimeError> {
        self.handlers.borrow_mut().set_interest(id, interest)
    }

    /// Run `callback` once `interval` seconds have passed (`0` runs it on
    /// the next loop iteration).
    ///
    /// The callback receives its current interval and decides through the
    /// returned [`TaskStatus`] whether it runs again.
    pub fn schedule_task<F>(&self, interval: u32, callback: F) -> Result<(), RuntimeError>
    where
        F: FnMut(&Runtime<H>, u32) -> TaskStatus + 'static,
    {
        self.tasks
            .borrow_mut()
            .schedule(Instant::now(), interval, Box::new(callback))
            .map(|_| ())
    }

    /// Ask the loop to stop once the current iteration completes.
    pub fn terminate(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.phase.compare_exchange(
                LoopPhase::Running as u8,
                LoopPhase::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            info!("Termination requested");
        }
    }

    /// Re-read the configuration file through [`Hooks::parse_config`].
    ///
    /// On success the new configuration replaces the current one, which is
    /// handed to [`Hooks::config_cleanup`]. On failure the current
    /// configuration stays in place.
    pub fn reload_config(&self) -> Result<(), RuntimeError> {
        let Some(path) = self.config.config_file.as_deref() else {
            return Ok(());
        };

        let previous = self.app_config();
        if previous.is_some() {
            debug!("Reloading configuration from {}", path.display());
        } else {
            debug!("Loading configuration from {}", path.display());
        }

        let parsed = self
            .hooks
            .parse_config(path, previous.as_deref())
            .map_err(|e| RuntimeError::Config(format!("{}: {}", path.display(), e)))?;
        drop(previous);

        match parsed {
            Some(config) => {
                self.replace_app_config(Some(Rc::new(config)));
                info!("Configuration loaded from {}", path.display());
            }
            None => debug!("No configuration produced from {}", path.display()),
        }
        Ok(())
    }

    fn replace_app_config(&self, config: Option<Rc<H::Config>>) {
        let previous = self.app_config.replace(config);
        if let Some(previous) = previous {
            match Rc::try_unwrap(previous) {
                Ok(previous) => self.hooks.config_cleanup(previous),
                Err(_) => debug!("Previous configuration still referenced, released on last drop"),
            }
        }
    }

    /// Run the daemon until it is terminated.
    ///
    /// Installs the signal bridge, daemonizes unless running in the
    /// foreground, loads the configuration and calls [`Hooks::initialize`]
    /// before entering the loop. A runtime can only be run once.
    pub fn run(&self) -> Result<(), RuntimeError> {
        if let Err(current) = self.phase.compare_exchange(
            LoopPhase::NotStarted as u8,
            LoopPhase::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(RuntimeError::InvalidStateTransition {
                from: LoopPhase::from(current),
                to: LoopPhase::Running,
            });
        }
        self.running.store(true, Ordering::SeqCst);

        if let Err(e) = self.install_signal_bridge() {
            error!("Failed to set up signal handling: {}", e);
            self.teardown();
            return Err(e);
        }

        if !self.config.foreground {
            debug!(
                "Daemonizing (pid file: {:?}, credentials: {:?})",
                self.config.pid_file, self.config.credentials
            );
            match daemonize(self.config.pid_file.as_deref(), self.config.credentials) {
                Ok(pid_file) => *self.pid_file.borrow_mut() = pid_file,
                Err(e) => {
                    error!("Daemonization failed: {}", e);
                    self.teardown();
                    return Err(e.into());
                }
            }
        }

        // Privileges are already dropped at this point.
        if let Err(e) = self.reload_config() {
            warn!(
                "Failed to read application configuration, continuing with defaults: {}",
                e
            );
        }

        let result = match self.hooks.initialize(self) {
            Ok(()) => self.event_loop(),
            Err(e) => {
                error!("Initialization failed: {}", e);
                Err(RuntimeError::InitializeFailed(e.to_string()))
            }
        };

        self.shutdown();
        result
    }

    fn install_signal_bridge(&self) -> Result<(), RuntimeError> {
        let bridge = SignalBridge::install()?;
        let fd = bridge.fd();
        *self.bridge.borrow_mut() = Some(bridge);

        self.register_handler(fd, PollFlags::POLLIN, |rt, _event| {
            let signal = rt.bridge.borrow().as_ref().and_then(SignalBridge::read_signal);
            if let Some(signal) = signal {
                rt.dispatch_signal(signal);
            }
            Ok(())
        })?;
        Ok(())
    }

    fn dispatch_signal(&self, signal: DaemonSignal) {
        info!("Received {} signal", signal);

        if signal == DaemonSignal::Reload {
            if let Err(e) = self.reload_config() {
                warn!("Configuration reload rejected: {}", e);
            }
        }

        self.hooks.signal_handler(self, signal);

        if signal == DaemonSignal::Terminate {
            self.terminate();
        }
    }

    fn event_loop(&self) -> Result<(), RuntimeError> {
        let timeout = PollTimeout::from(self.config.poll_timeout_ms);
        info!("Entering event loop (PID: {})", std::process::id());

        while self.is_running() {
            self.run_due_tasks(Instant::now());

            let result = self.handlers.borrow().wait(timeout);
            let ready = match result {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("Failed to poll: {}", e);
                    self.terminate();
                    return Err(RuntimeError::Poll(e));
                }
            };

            if ready.is_empty() {
                self.hooks.idle_handler(self);
                continue;
            }

            for (id, readiness) in ready {
                self.dispatch(id, readiness);
            }
        }

        Ok(())
    }

    /// Fire every task whose deadline is at or before `now`, in slot order.
    fn run_due_tasks(&self, now: Instant) {
        let capacity = self.tasks.borrow().capacity();
        for index in 0..capacity {
            let due = self.tasks.borrow_mut().take_due(index, now);
            let Some((id, interval, mut callback)) = due else {
                continue;
            };

            let status = callback(self, interval);
            self.tasks.borrow_mut().complete(id, callback, status, now);
        }
    }

    fn dispatch(&self, id: HandlerId, readiness: PollFlags) {
        // An earlier handler in this pass may have removed the registration.
        let taken = self.handlers.borrow_mut().take(id);
        let Some((registered, mut callback)) = taken else {
            return;
        };

        let fd = registered.fd();
        let mut event = Event::new(fd, registered.interest(), readiness);
        match callback(self, &mut event) {
            Ok(()) => self
                .handlers
                .borrow_mut()
                .restore(id, callback, event.interest()),
            Err(e) => {
                warn!("Handler for fd#{} failed, closing it: {}", fd, e);
                let removed = self.handlers.borrow_mut().unregister(id);
                if removed.is_ok() {
                    if let Err(e) = nix::unistd::close(fd) {
                        debug!("Failed to close fd#{}: {}", fd, e);
                    }
                }
                drop(callback);
            }
        }
    }

    fn shutdown(&self) {
        debug!("Cleaning up...");
        self.running.store(false, Ordering::SeqCst);

        let pid_file = self.pid_file.borrow_mut().take();
        if let Some(mut pid_file) = pid_file {
            if let Err(e) = pid_file.remove() {
                warn!(
                    "Failed to remove PID file {}: {}",
                    pid_file.path().display(),
                    e
                );
            }
        }

        if let Err(e) = self.hooks.cleanup(self) {
            warn!("Failed to perform cleanup: {}", e);
        }

        self.replace_app_config(None);
        self.teardown();
        info!("Event loop stopped");
    }

    /// Release tables and the signal bridge without calling any hook.
    fn teardown(&self) {
        self.running.store(false, Ordering::SeqCst);

        let pending = self.tasks.borrow_mut().clear();
        if pending > 0 {
            debug!("Dropped {} pending task(s)", pending);
        }
        self.handlers.borrow_mut().clear();

        let bridge = self.bridge.borrow_mut().take();
        drop(bridge);

        self.phase
            .store(LoopPhase::Stopped as u8, Ordering::SeqCst);
    }
}

impl<H: Hooks> std::fmt::Debug for Runtime<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("phase", &self.phase())
            .field("handlers", &self.handler_count())
            .field("handler_capacity", &self.handlers.borrow().capacity())
            .field("tasks", &self.task_count())
            .field("task_capacity", &self.tasks.borrow().capacity())
            .field("foreground", &self.config.foreground)
            .finish()
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
