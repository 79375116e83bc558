//! Log routing for the bridge daemon.
//!
//! In the foreground everything goes to stderr. A daemon has stderr pointed
//! at `/dev/null`, so background logging writes to a daily rolling file
//! instead. The writer is blocking: a background worker thread would not
//! survive the fork.

use std::path::Path;

use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Prefix of the log files written in background mode.
pub const LOG_FILE_PREFIX: &str = "udaemon-bridge";

/// Handle for switching the log level of a running process.
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogControl {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self { handle }
    }

    /// Switch between `debug` and `info` logging.
    pub fn set_debug(&self, debug: bool) {
        let level = level_name(debug);
        if let Err(e) = self.handle.reload(EnvFilter::new(level)) {
            tracing::warn!("Failed to change log level to {}: {}", level, e);
        }
    }

    /// Current filter directives, if the subscriber is still alive.
    pub fn current(&self) -> Option<String> {
        self.handle.with_current(|filter| filter.to_string()).ok()
    }
}

impl std::fmt::Debug for LogControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogControl")
            .field("filter", &self.current())
            .finish()
    }
}

fn level_name(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the initial level chosen by `debug`.
pub fn init_tracing(
    foreground: bool,
    debug: bool,
    log_dir: &Path,
) -> Result<LogControl, Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_name(debug)));
    let (filter, handle) = reload::Layer::new(env_filter);

    if foreground {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        std::fs::create_dir_all(log_dir)?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .max_log_files(7)
            .build(log_dir)?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false),
            )
            .try_init()?;

        info!("Logging to {}", log_dir.display());
    }

    Ok(LogControl::new(handle))
}
