//! PID file management for daemon processes.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::Uid;
use tracing::{debug, info, warn};

use crate::credentials::Credentials;

/// Permission bits of a created pid file (rw-r--r--).
pub const PID_FILE_MODE: u32 = 0o644;

/// A pid file written by the daemonized process and removed on shutdown.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    locked: bool,
}

impl PidFile {
    /// Create a new PID file manager.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            locked: false,
        }
    }

    /// Get the PID file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current process PID to the file.
    pub fn write_pid(&mut self, owner: Option<Credentials>) -> io::Result<()> {
        self.write_pid_value(std::process::id(), owner)
    }

    /// Write a specific PID value to the file.
    ///
    /// Any existing file is unlinked first; the new file is created
    /// exclusively and never through a symlink. When running as root and
    /// `owner` names another account, ownership is handed to it on a
    /// best-effort basis.
    pub fn write_pid_value(&mut self, pid: u32, owner: Option<Credentials>) -> io::Result<()> {
        let is_root = Uid::current().is_root();

        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Unable to remove stale PID file {}: {}", self.path.display(), e);
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(PID_FILE_MODE)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&self.path)?;

        if let Some(owner) = owner.filter(|o| is_root && o.uid != 0) {
            if let Err(e) = std::os::unix::fs::fchown(&file, Some(owner.uid), Some(owner.gid)) {
                warn!(
                    "Unable to change ownership of PID file {} to {}: {}",
                    self.path.display(),
                    owner,
                    e
                );
            }
        }

        writeln!(file, "{}", pid)?;

        self.locked = true;
        info!("PID file created: {} (PID: {})", self.path.display(), pid);
        Ok(())
    }

    /// Remove the PID file. A file that is already gone is not an error.
    pub fn remove(&mut self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("PID file removed: {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        self.locked = false;
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.locked {
            // Privileges may already be dropped; the directory might not be
            // writable any more.
            if let Err(e) = self.remove() {
                debug!("Failed to remove PID file on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
#[path = "pid_tests.rs"]
mod tests;
