//! CLI definitions for udaemon-bridge.

use std::path::PathBuf;

use clap::Parser;

/// PID file used when `-p` is not given.
pub(crate) const DEFAULT_PID_FILE: &str = "/var/run/udaemon-bridge.pid";

/// udaemon-bridge CLI.
#[derive(Parser, Debug)]
#[command(name = "udaemon-bridge")]
#[command(about = "Keeps a TCP connection to an upstream server alive, as a daemon")]
#[command(version)]
pub(crate) struct Cli {
    /// Application configuration file (TOML), re-read on SIGHUP
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    pub debug: bool,

    /// Stay in the foreground and log to stderr
    #[arg(short, long)]
    pub foreground: bool,

    /// PID file written by the daemon
    #[arg(short, long, default_value = DEFAULT_PID_FILE)]
    pub pid_file: PathBuf,

    /// Drop privileges to user[:group] (or uid[:gid]) when started as root [default: nobody]
    #[arg(short, long)]
    pub user: Option<String>,

    /// Directory for log files when running in the background
    #[arg(long, env = "UDAEMON_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    /// Log directory, defaulting to the system temp dir.
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["udaemon-bridge"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.foreground);
        assert!(cli.config.is_none());
        assert!(cli.user.is_none());
        assert_eq!(cli.pid_file, PathBuf::from(DEFAULT_PID_FILE));
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from([
            "udaemon-bridge",
            "-d",
            "-f",
            "-c",
            "/etc/bridge.toml",
            "-p",
            "/run/bridge.pid",
            "-u",
            "nobody:nogroup",
        ])
        .unwrap();
        assert!(cli.debug);
        assert!(cli.foreground);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/bridge.toml")));
        assert_eq!(cli.pid_file, PathBuf::from("/run/bridge.pid"));
        assert_eq!(cli.user.as_deref(), Some("nobody:nogroup"));
    }

    #[test]
    fn test_log_dir() {
        let cli = Cli::try_parse_from(["udaemon-bridge", "--log-dir", "/var/log/bridge"]).unwrap();
        assert_eq!(cli.log_dir(), PathBuf::from("/var/log/bridge"));
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["udaemon-bridge", "-V"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
