//! # udaemon core
//!
//! Minimal single-threaded daemon runtime.
//!
//! ## Features
//!
//! - Poll-based event reactor over a fixed set of descriptor registrations
//! - Deadline-triggered tasks that re-arm themselves from their return value
//! - Self-pipe signal bridge (SIGTERM/SIGINT terminate, SIGHUP reloads configuration)
//! - Double-fork daemonization with a synchronous startup handshake
//! - PID file management and privilege dropping
//!
//! ## Usage
//!
//! ```rust,ignore
//! use udaemon_core::{Hooks, Runtime, RuntimeConfig, TaskStatus};
//!
//! struct App;
//!
//! impl Hooks for App {
//!     type Config = ();
//!     type State = u32;
//!
//!     fn initialize(&self, rt: &Runtime<Self>) -> Result<(), udaemon_core::HookError> {
//!         rt.schedule_task(5, |rt, _interval| {
//!             *rt.state_mut() += 1;
//!             TaskStatus::Reschedule(5)
//!         })?;
//!         Ok(())
//!     }
//! }
//!
//! let runtime = Runtime::new(RuntimeConfig::default(), App, 0)?;
//! runtime.run()?;
//! ```

pub mod config;
pub mod credentials;
pub mod daemonize;
pub mod error;
pub mod pid;
pub mod reactor;
pub mod runtime;
pub mod scheduler;
pub mod signal;

mod slots;

// Re-exports
pub use config::RuntimeConfig;
pub use credentials::Credentials;
pub use daemonize::daemonize;
pub use error::{DaemonizeError, HookError, LoopPhase, RuntimeError};
pub use pid::PidFile;
pub use reactor::{Event, HandlerId, Interest};
pub use runtime::{Hooks, Runtime};
pub use scheduler::TaskStatus;
pub use signal::{DaemonSignal, SignalBridge};

/// Re-exported so applications can build interest masks.
pub use nix::poll::PollFlags;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
