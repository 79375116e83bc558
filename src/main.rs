//! udaemon-bridge - example daemon built on udaemon-core.
//!
//! Exit codes: `0` after a clean shutdown, the daemonization stage code when
//! the detached process failed to start, `1` for anything else.

mod app_config;
mod bridge;
mod cli;
mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use thiserror::Error;
use tracing::{error, info};

use udaemon_core::{Credentials, Runtime, RuntimeConfig, RuntimeError};

use crate::bridge::{BridgeHooks, BridgeState};
use crate::cli::Cli;

#[derive(Debug, Error)]
enum AppError {
    #[error("Failed to set up logging: {0}")]
    Logging(String),

    #[error("Invalid path {path}: {source}")]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl AppError {
    fn exit_code(&self) -> u8 {
        match self {
            AppError::Runtime(RuntimeError::Daemonize(e)) => e.exit_code(),
            _ => 1,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("udaemon-bridge: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// The daemon changes its working directory to `/`.
fn absolute(path: &Path) -> Result<PathBuf, AppError> {
    std::path::absolute(path).map_err(|source| AppError::Path {
        path: path.to_path_buf(),
        source,
    })
}

fn run(cli: Cli) -> Result<(), AppError> {
    let log_dir = absolute(&cli.log_dir())?;
    let log = logging::init_tracing(cli.foreground, cli.debug, &log_dir)
        .map_err(|e| AppError::Logging(e.to_string()))?;

    // Without -u the daemon still gives up root, falling back to `nobody`.
    let credentials = Credentials::parse(cli.user.as_deref())?;
    info!("Requested to run as user {}", credentials);

    let config = RuntimeConfig {
        debug: cli.debug,
        foreground: cli.foreground,
        pid_file: Some(absolute(&cli.pid_file)?),
        config_file: cli.config.as_deref().map(absolute).transpose()?,
        credentials: Some(credentials),
        ..Default::default()
    };

    let runtime = Runtime::new(config, BridgeHooks::new(Some(log)), BridgeState::default())?;
    info!(
        "Starting udaemon-bridge v{} (udaemon-core {})",
        env!("CARGO_PKG_VERSION"),
        udaemon_core::VERSION
    );

    runtime.run()?;

    let bytes = runtime.state().bytes_read();
    info!("udaemon-bridge stopped ({} bytes received)", bytes);
    Ok(())
}
