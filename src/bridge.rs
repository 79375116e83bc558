//! Reconnecting TCP client built on the udaemon runtime.
//!
//! The bridge keeps one connection to an upstream server open and logs what
//! it receives. Failed connection attempts back off exponentially, SIGHUP
//! reconnects after reloading the configuration and SIGUSR1/SIGUSR2 switch
//! logging between `info` and `debug`.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::path::Path;

use tracing::{debug, info, warn};
use udaemon_core::{
    DaemonSignal, Event, HandlerId, HookError, Hooks, PollFlags, Runtime, RuntimeError,
    TaskStatus,
};

use crate::app_config::BridgeConfig;
use crate::logging::LogControl;

/// Connection state owned by the runtime.
#[derive(Debug, Default)]
pub struct BridgeState {
    stream: Option<TcpStream>,
    handler: Option<HandlerId>,
    connected: bool,
    reconnect_pending: bool,
    bytes_read: u64,
}

impl BridgeState {
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

#[derive(Debug)]
pub struct BridgeHooks {
    log: Option<LogControl>,
}

impl BridgeHooks {
    pub fn new(log: Option<LogControl>) -> Self {
        Self { log }
    }

    fn set_debug(&self, debug: bool) {
        match &self.log {
            Some(log) => log.set_debug(debug),
            None => debug!("No log control installed"),
        }
    }
}

impl Hooks for BridgeHooks {
    type Config = BridgeConfig;
    type State = BridgeState;

    fn initialize(&self, rt: &Runtime<Self>) -> Result<(), HookError> {
        info!(
            "Initializing bridge, running against udaemon {} (debug logging {})...",
            udaemon_core::VERSION,
            if rt.config().debug { "on" } else { "off" }
        );
        debug!(
            "Application configuration is {}",
            if rt.app_config().is_some() { "present" } else { "NOT present" }
        );

        schedule_reconnect(rt)?;
        Ok(())
    }

    fn signal_handler(&self, rt: &Runtime<Self>, signal: DaemonSignal) {
        match signal {
            DaemonSignal::Reload => {
                if let Err(e) = schedule_reconnect(rt) {
                    warn!("Unable to schedule reconnect: {}", e);
                }
            }
            DaemonSignal::User1 => {
                info!("Turning off debug logging...");
                self.set_debug(false);
                debug!("No longer logging at debug level...");
            }
            DaemonSignal::User2 => {
                info!("Turning on debug logging...");
                self.set_debug(true);
                debug!("Now logging at debug level...");
            }
            DaemonSignal::Terminate => debug!("Got signal: {}", signal),
        }
    }

    fn cleanup(&self, rt: &Runtime<Self>) -> Result<(), HookError> {
        debug!("Cleaning up bridge...");
        disconnect(rt);
        Ok(())
    }

    fn parse_config(
        &self,
        path: &Path,
        _previous: Option<&BridgeConfig>,
    ) -> Result<Option<BridgeConfig>, HookError> {
        debug!("Parsing bridge configuration...");
        Ok(Some(BridgeConfig::load(path)?))
    }

    fn config_cleanup(&self, config: BridgeConfig) {
        debug!(
            "Releasing configuration for upstream {}",
            config.upstream.address
        );
    }
}

/// Next reconnect interval after a failed attempt: 1, 2, 4, ... up to `max`.
pub fn next_backoff(interval: u32, max: u32) -> u32 {
    let next = if interval == 0 {
        1
    } else {
        interval.saturating_mul(2)
    };
    next.min(max.max(1))
}

/// Queue a (re)connect attempt unless one is already pending.
pub fn schedule_reconnect(rt: &Runtime<BridgeHooks>) -> Result<(), RuntimeError> {
    if rt.state().reconnect_pending {
        debug!("Reconnect already pending");
        return Ok(());
    }

    rt.schedule_task(0, reconnect)?;
    rt.state_mut().reconnect_pending = true;
    Ok(())
}

fn reconnect(rt: &Runtime<BridgeHooks>, interval: u32) -> TaskStatus {
    let was_connected = rt.state().connected;
    if was_connected {
        debug!("Reconnecting to server (interval {})...", interval);
        disconnect(rt);
    } else {
        debug!("Connecting to server (interval {})...", interval);
    }

    let config = rt.app_config().map(|c| (*c).clone()).unwrap_or_default();
    match connect(rt, &config) {
        Ok(()) => {
            let mut state = rt.state_mut();
            state.connected = true;
            state.reconnect_pending = false;
            TaskStatus::Finished
        }
        Err(ConnectError::Unreachable(e)) => {
            let next = next_backoff(interval, config.max_backoff_secs);
            warn!(
                "Unable to connect to {}: {}; retrying in {}s",
                config.upstream.address, e, next
            );
            TaskStatus::Reschedule(next)
        }
        Err(ConnectError::Register(e)) => {
            warn!("Failed to register event handler: {}", e);
            rt.state_mut().reconnect_pending = false;
            TaskStatus::Aborted
        }
    }
}

enum ConnectError {
    Unreachable(io::Error),
    Register(RuntimeError),
}

fn connect(rt: &Runtime<BridgeHooks>, config: &BridgeConfig) -> Result<(), ConnectError> {
    let mut stream =
        TcpStream::connect(config.upstream.address.as_str()).map_err(ConnectError::Unreachable)?;

    if !config.greeting.is_empty() {
        stream
            .write_all(format!("{}\n", config.greeting).as_bytes())
            .map_err(ConnectError::Unreachable)?;
    }
    stream
        .set_nonblocking(true)
        .map_err(ConnectError::Unreachable)?;

    let id = rt
        .register_handler(stream.as_raw_fd(), PollFlags::POLLIN, on_upstream_ready)
        .map_err(ConnectError::Register)?;

    info!("Connected to {}", config.upstream.address);
    let mut state = rt.state_mut();
    state.stream = Some(stream);
    state.handler = Some(id);
    Ok(())
}

/// Drop the registration, then close the socket.
fn disconnect(rt: &Runtime<BridgeHooks>) {
    let (handler, stream) = {
        let mut state = rt.state_mut();
        (state.handler.take(), state.stream.take())
    };

    if let Some(id) = handler {
        if let Err(e) = rt.unregister_handler(id) {
            debug!("Failed to remove event handler: {}", e);
        }
    }
    if stream.is_some() {
        debug!("Connection closed");
    }
}

/// The bridge owns its socket, so failures are handled here and never
/// returned to the runtime, which would close the descriptor a second time.
fn on_upstream_ready(rt: &Runtime<BridgeHooks>, event: &mut Event) -> io::Result<()> {
    if event.is_hangup() {
        info!("Socket closed by server...");
        event.set_interest(PollFlags::empty());
        request_reconnect(rt);
        return Ok(());
    }

    if !event.is_readable() {
        return Ok(());
    }

    let mut buf = [0u8; 128];
    let result = match rt.state().stream.as_ref() {
        Some(mut stream) => stream.read(&mut buf),
        None => return Ok(()),
    };

    match result {
        Ok(0) => {
            info!("Socket closed by server (EOF)...");
            // Stop polling for input; otherwise the EOF is reported on every
            // pass until the reconnect task runs.
            event.set_interest(event.interest() - PollFlags::POLLIN);
            request_reconnect(rt);
        }
        Ok(n) => {
            info!("Read {} bytes from server!", n);
            rt.state_mut().bytes_read += n as u64;
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            warn!("Error obtained while reading from server: {}", e);
            event.set_interest(PollFlags::empty());
            request_reconnect(rt);
        }
    }
    Ok(())
}

fn request_reconnect(rt: &Runtime<BridgeHooks>) {
    if let Err(e) = schedule_reconnect(rt) {
        warn!("Unable to schedule reconnect: {}", e);
    }
}
