//! Runtime configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;

/// Immutable behavioral flags of the runtime.
///
/// Owned by the caller; the runtime never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Debug verbosity requested by the caller.
    ///
    /// The runtime does not act on it; hooks read it through
    /// `Runtime::config` to pick their own log level.
    #[serde(default)]
    pub debug: bool,

    /// Stay in the foreground instead of daemonizing.
    #[serde(default = "default_foreground")]
    pub foreground: bool,

    /// Pid file written by the daemonized process.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Application configuration file handed to the config parser hook.
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// Identity to drop privileges to when daemonizing as root.
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Number of descriptor registrations, including the signal bridge.
    #[serde(default = "default_handler_capacity")]
    pub handler_capacity: usize,

    /// Number of scheduled task slots.
    #[serde(default = "default_task_capacity")]
    pub task_capacity: usize,

    /// Upper bound of a single readiness wait (in milliseconds).
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u16,
}

fn default_foreground() -> bool {
    true
}

fn default_handler_capacity() -> usize {
    16
}

fn default_task_capacity() -> usize {
    16
}

fn default_poll_timeout() -> u16 {
    100
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            foreground: default_foreground(),
            pid_file: None,
            config_file: None,
            credentials: None,
            handler_capacity: default_handler_capacity(),
            task_capacity: default_task_capacity(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

impl RuntimeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        // One handler slot is always taken by the signal bridge.
        if !(2..=255).contains(&self.handler_capacity) {
            return Err("handler_capacity must be between 2 and 255".to_string());
        }

        if !(1..=255).contains(&self.task_capacity) {
            return Err("task_capacity must be between 1 and 255".to_string());
        }

        if self.poll_timeout_ms == 0 {
            return Err("poll_timeout_ms must be > 0".to_string());
        }

        if let Some(ref pid_file) = self.pid_file {
            if pid_file.is_relative() {
                return Err(format!(
                    "pid_file must be an absolute path: {}",
                    pid_file.display()
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
