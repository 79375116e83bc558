//! Runtime-related errors.

use nix::errno::Errno;
use thiserror::Error;

/// Error type returned by application hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while registering work with, or running, the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A fixed-capacity table has no free slot left.
    #[error("No free slot in {table} table (capacity {capacity})")]
    ResourceExhausted { table: &'static str, capacity: usize },

    /// A required argument was missing or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle does not refer to a live registration.
    #[error("No such registration")]
    NotFound,

    /// Waiting for readiness failed for a reason other than an interrupt.
    #[error("Failed to poll descriptors: {0}")]
    Poll(Errno),

    /// Failed to set up signal handling.
    #[error("Failed to set up signal handlers: {0}")]
    SignalSetup(String),

    /// Another signal bridge already owns the process-wide signal handlers.
    #[error("Signal bridge already installed in this process")]
    SignalBridgeActive,

    /// The initialize hook reported a failure.
    #[error("Initialization failed: {0}")]
    InitializeFailed(String),

    /// Invalid lifecycle transition.
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: LoopPhase, to: LoopPhase },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Daemonization failed before the process was detached.
    #[error("Daemonization failed: {0}")]
    Daemonize(#[from] DaemonizeError),

    /// User name could not be resolved.
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Group name could not be resolved.
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    /// The user database lookup itself failed.
    #[error("User database lookup failed: {0}")]
    UserLookup(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stage failures of the daemonization handshake.
///
/// Each variant maps to a distinct process exit code; the original invoking
/// process exits with that code when the stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DaemonizeError {
    #[error("unable to create handshake pipe: {0}")]
    PipeCreateFailed(Errno),

    #[error("unable to fork: {0}")]
    ForkFailed(Errno),

    #[error("unable to read handshake result: {0}")]
    PipeReadFailed(Errno),

    #[error("unable to create new session: {0}")]
    SetsidFailed(Errno),

    #[error("unable to fork session leader: {0}")]
    SecondForkFailed(Errno),

    #[error("unable to redirect standard streams to /dev/null: {0}")]
    DevNullFailed(Errno),

    #[error("unable to create pid file: {0}")]
    PidFileFailed(Errno),

    #[error("unable to change directory to /: {0}")]
    ChdirFailed(Errno),

    #[error("unable to drop privileges: {0}")]
    PrivilegeDropFailed(Errno),
}

impl DaemonizeError {
    /// Exit code reported through the handshake pipe.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonizeError::PipeCreateFailed(_) => 10,
            DaemonizeError::ForkFailed(_) => 11,
            DaemonizeError::PipeReadFailed(_) => 12,
            DaemonizeError::SetsidFailed(_) => 20,
            DaemonizeError::SecondForkFailed(_) => 21,
            DaemonizeError::DevNullFailed(_) => 22,
            DaemonizeError::PidFileFailed(_) => 23,
            DaemonizeError::ChdirFailed(_) => 25,
            DaemonizeError::PrivilegeDropFailed(_) => 26,
        }
    }
}

/// Lifecycle phase of the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopPhase {
    /// `run()` has not been called yet.
    NotStarted = 0,
    /// The loop is iterating.
    Running = 1,
    /// Termination requested; the current iteration is finishing.
    Stopping = 2,
    /// The loop has exited and cleanup ran.
    Stopped = 3,
}

impl From<u8> for LoopPhase {
    fn from(v: u8) -> Self {
        match v {
            0 => LoopPhase::NotStarted,
            1 => LoopPhase::Running,
            2 => LoopPhase::Stopping,
            _ => LoopPhase::Stopped,
        }
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopPhase::NotStarted => write!(f, "not_started"),
            LoopPhase::Running => write!(f, "running"),
            LoopPhase::Stopping => write!(f, "stopping"),
            LoopPhase::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhausted_error() {
        let err = RuntimeError::ResourceExhausted {
            table: "handler",
            capacity: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("handler"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn test_daemonize_exit_codes_are_distinct() {
        let errors = [
            DaemonizeError::PipeCreateFailed(Errno::EMFILE),
            DaemonizeError::ForkFailed(Errno::EAGAIN),
            DaemonizeError::PipeReadFailed(Errno::EIO),
            DaemonizeError::SetsidFailed(Errno::EPERM),
            DaemonizeError::SecondForkFailed(Errno::EAGAIN),
            DaemonizeError::DevNullFailed(Errno::ENOENT),
            DaemonizeError::PidFileFailed(Errno::EACCES),
            DaemonizeError::ChdirFailed(Errno::EACCES),
            DaemonizeError::PrivilegeDropFailed(Errno::EPERM),
        ];

        let mut codes: Vec<u8> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_daemonize_error_conversion() {
        let err: RuntimeError = DaemonizeError::ForkFailed(Errno::EAGAIN).into();
        assert!(err.to_string().contains("fork"));
        match err {
            RuntimeError::Daemonize(inner) => assert_eq!(inner.exit_code(), 11),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_loop_phase_conversion() {
        assert_eq!(LoopPhase::from(0), LoopPhase::NotStarted);
        assert_eq!(LoopPhase::from(1), LoopPhase::Running);
        assert_eq!(LoopPhase::from(2), LoopPhase::Stopping);
        assert_eq!(LoopPhase::from(3), LoopPhase::Stopped);
        assert_eq!(LoopPhase::from(99), LoopPhase::Stopped);
    }

    #[test]
    fn test_loop_phase_display() {
        assert_eq!(LoopPhase::NotStarted.to_string(), "not_started");
        assert_eq!(LoopPhase::Running.to_string(), "running");
        assert_eq!(LoopPhase::Stopping.to_string(), "stopping");
        assert_eq!(LoopPhase::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_invalid_state_transition() {
        let err = RuntimeError::InvalidStateTransition {
            from: LoopPhase::Stopped,
            to: LoopPhase::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("Stopped"));
        assert!(msg.contains("Running"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RuntimeError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }
}
