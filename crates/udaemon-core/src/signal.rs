//! Bridge from asynchronous OS signal delivery into the event loop.
//!
//! The OS-level handler does exactly one thing: a non-blocking write of one
//! byte, naming the logical signal, into a pipe. The read end is an ordinary
//! descriptor registered with the reactor, so decoding the byte and running
//! application code happens in normal execution context.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, info, warn};

use crate::error::RuntimeError;

/// Write end of the signal pipe. Set once before handlers are installed,
/// cleared after they are restored; the signal handler only reads it.
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

/// OS signals routed through the bridge.
const BRIDGED_SIGNALS: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// OS signals ignored while the bridge is installed. A stray `alarm()` would
/// otherwise terminate the daemon.
const IGNORED_SIGNALS: [Signal; 2] = [Signal::SIGPIPE, Signal::SIGALRM];

/// Logical signal delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DaemonSignal {
    /// Stop the event loop (SIGTERM, SIGINT).
    Terminate = 1,
    /// Reload configuration (SIGHUP).
    Reload = 2,
    /// Application-defined (SIGUSR1).
    User1 = 3,
    /// Application-defined (SIGUSR2).
    User2 = 4,
}

impl DaemonSignal {
    /// Map an OS signal to its logical kind.
    pub fn from_os(signal: Signal) -> Option<Self> {
        match signal {
            Signal::SIGTERM | Signal::SIGINT => Some(DaemonSignal::Terminate),
            Signal::SIGHUP => Some(DaemonSignal::Reload),
            Signal::SIGUSR1 => Some(DaemonSignal::User1),
            Signal::SIGUSR2 => Some(DaemonSignal::User2),
            _ => None,
        }
    }

    /// Decode a byte read from the signal pipe.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(DaemonSignal::Terminate),
            2 => Some(DaemonSignal::Reload),
            3 => Some(DaemonSignal::User1),
            4 => Some(DaemonSignal::User2),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for DaemonSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonSignal::Terminate => write!(f, "TERMINATE"),
            DaemonSignal::Reload => write!(f, "RELOAD"),
            DaemonSignal::User1 => write!(f, "USER1"),
            DaemonSignal::User2 => write!(f, "USER2"),
        }
    }
}

/// Runs in signal-delivery context: one non-blocking write, nothing else.
extern "C" fn on_os_signal(signo: libc::c_int) {
    let Some(signal) = Signal::try_from(signo).ok().and_then(DaemonSignal::from_os) else {
        return;
    };

    let fd = SIGNAL_PIPE.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    // The interrupted code must not observe our errno.
    let saved = Errno::last_raw();
    let buf = [signal.as_byte()];
    // SAFETY: write(2) is async-signal-safe and `buf` outlives the call. A
    // full pipe drops the signal rather than blocking.
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), 1);
    }
    Errno::set_raw(saved);
}

/// Mark a descriptor non-blocking and close-on-exec.
pub(crate) fn set_nonblocking_cloexec(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Owner of the signal pipe and of the process-wide signal dispositions.
///
/// Only one bridge can exist per process. Dropping it restores the previous
/// dispositions and closes the pipe.
pub struct SignalBridge {
    reader: File,
    writer: File,
    previous: Vec<(Signal, SigAction)>,
}

impl SignalBridge {
    /// Create the pipe, then route the bridged signals into it.
    ///
    /// `SIGPIPE` and `SIGALRM` are ignored while the bridge is installed.
    pub fn install() -> Result<Self, RuntimeError> {
        let (reader, writer): (OwnedFd, OwnedFd) = nix::unistd::pipe()
            .map_err(|e| RuntimeError::SignalSetup(format!("unable to create pipe: {}", e)))?;
        for fd in [reader.as_raw_fd(), writer.as_raw_fd()] {
            set_nonblocking_cloexec(fd).map_err(|e| {
                RuntimeError::SignalSetup(format!("unable to configure pipe: {}", e))
            })?;
        }

        SIGNAL_PIPE
            .compare_exchange(-1, writer.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RuntimeError::SignalBridgeActive)?;

        // From here on Drop undoes whatever was installed.
        let mut bridge = Self {
            reader: File::from(reader),
            writer: File::from(writer),
            previous: Vec::with_capacity(BRIDGED_SIGNALS.len() + IGNORED_SIGNALS.len()),
        };

        let forward = SigAction::new(
            SigHandler::Handler(on_os_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in BRIDGED_SIGNALS {
            bridge.replace_action(signal, &forward)?;
        }

        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        for signal in IGNORED_SIGNALS {
            bridge.replace_action(signal, &ignore)?;
        }

        info!("OS signal handlers installed (SIGTERM, SIGINT, SIGHUP, SIGUSR1, SIGUSR2)");
        Ok(bridge)
    }

    fn replace_action(&mut self, signal: Signal, action: &SigAction) -> Result<(), RuntimeError> {
        // SAFETY: the installed handler is async-signal-safe (see on_os_signal).
        let previous = unsafe { sigaction(signal, action) }
            .map_err(|e| RuntimeError::SignalSetup(format!("{}: {}", signal, e)))?;
        self.previous.push((signal, previous));
        Ok(())
    }

    /// Read end of the pipe, to be registered with the reactor.
    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Read and decode one pending signal byte.
    ///
    /// Returns `None` when nothing is pending or the byte is not a known
    /// signal.
    pub fn read_signal(&self) -> Option<DaemonSignal> {
        let mut buf = [0u8; 1];
        match (&self.reader).read(&mut buf) {
            Ok(1) => {
                let signal = DaemonSignal::from_byte(buf[0]);
                if signal.is_none() {
                    warn!("Unknown signal event {} on signal pipe", buf[0]);
                }
                signal
            }
            Ok(_) => {
                warn!("Signal pipe closed");
                None
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("Failed to read signal event: {}", e);
                None
            }
        }
    }

    /// Queue a logical signal without going through the OS.
    #[cfg(test)]
    pub(crate) fn send(&self, signal: DaemonSignal) -> io::Result<()> {
        use std::io::Write;

        (&self.writer).write_all(&[signal.as_byte()])
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: restores the disposition that was active before install.
            if let Err(e) = unsafe { sigaction(signal, &previous) } {
                warn!("Failed to restore handler for {}: {}", signal, e);
            }
        }
        // Only clear the slot if it still names this bridge's pipe.
        let _ = SIGNAL_PIPE.compare_exchange(
            self.writer.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        debug!("Signal bridge removed");
    }
}

#[cfg(test)]
#[path = "signal_tests.rs"]
mod tests;
