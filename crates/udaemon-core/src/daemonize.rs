//! Detaching from the controlling terminal.
//!
//! The invoking process forks and then blocks on a pipe until the detached
//! grandchild reports a one-byte status. It exits with that status: `0`
//! once the daemon is fully set up, or the [`DaemonizeError::exit_code`] of
//! the stage that failed. Callers starting the daemon from a script can
//! therefore rely on the exit code.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2, fork, setgid, setsid, setuid, ForkResult, Uid};
use tracing::{debug, error, info};

use crate::credentials::Credentials;
use crate::error::DaemonizeError;
use crate::pid::PidFile;

/// Status byte reported once the daemon is ready.
pub const HANDSHAKE_OK: u8 = 0;

/// Detach the current process and become a daemon.
///
/// Only returns in the detached grandchild, handing back the written pid
/// file (if one was requested). The invoking process never returns; it exits
/// with the handshake status. An `Err` is returned only when the very first
/// steps fail, before anything was forked.
pub fn daemonize(
    pid_file: Option<&Path>,
    owner: Option<Credentials>,
) -> Result<Option<PidFile>, DaemonizeError> {
    let (reader, writer): (OwnedFd, OwnedFd) =
        nix::unistd::pipe().map_err(DaemonizeError::PipeCreateFailed)?;

    info!("Daemonizing process...");

    // SAFETY: the runtime is single-threaded; the child only performs
    // process setup before continuing into the event loop.
    match unsafe { fork() }.map_err(DaemonizeError::ForkFailed)? {
        ForkResult::Parent { child } => {
            drop(writer);
            let code = read_handshake(&mut File::from(reader));
            if code == HANDSHAKE_OK {
                info!("Daemon started (session leader was PID {})", child);
            } else {
                error!("Daemon failed to start (exit code {})", code);
            }
            std::process::exit(i32::from(code));
        }
        ForkResult::Child => drop(reader),
    }

    let mut writer = File::from(writer);
    match detach(pid_file, owner) {
        Ok(pid_file) => {
            report(&mut writer, HANDSHAKE_OK);
            info!("Process daemonized (PID: {})", std::process::id());
            Ok(pid_file)
        }
        Err(e) => {
            error!("Daemonization failed: {}", e);
            report(&mut writer, e.exit_code());
            // SAFETY: terminating a forked copy without running the
            // invoking process's exit handlers a second time.
            unsafe { libc::_exit(i32::from(e.exit_code())) }
        }
    }
}

/// Wait for the status byte written by the detached process.
///
/// A pipe that closes without a status, or fails to read, counts as
/// [`DaemonizeError::PipeReadFailed`]. An interrupted read is a failure too:
/// the signal bridge is already installed, so SIGINT or SIGTERM sent to the
/// waiting process only shows up as `EINTR` here.
pub fn read_handshake<R: Read>(reader: &mut R) -> u8 {
    let mut buf = [0u8; 1];
    match reader.read(&mut buf) {
        Ok(1) => buf[0],
        Ok(_) => {
            debug!("Handshake pipe closed without a status");
            DaemonizeError::PipeReadFailed(Errno::EPIPE).exit_code()
        }
        Err(e) => {
            debug!("Failed to read handshake status: {}", e);
            DaemonizeError::PipeReadFailed(errno_of(&e)).exit_code()
        }
    }
}

fn report(writer: &mut File, code: u8) {
    if let Err(e) = writer.write_all(&[code]) {
        debug!("Failed to report handshake status {}: {}", code, e);
    }
}

/// Runs in the first child: new session, second fork, then process setup in
/// the grandchild.
fn detach(
    pid_file: Option<&Path>,
    owner: Option<Credentials>,
) -> Result<Option<PidFile>, DaemonizeError> {
    setsid().map_err(DaemonizeError::SetsidFailed)?;

    // A session leader could reacquire a controlling terminal.
    // SAFETY: see `daemonize`.
    match unsafe { fork() }.map_err(DaemonizeError::SecondForkFailed)? {
        ForkResult::Parent { .. } => {
            // SAFETY: the intermediate process has nothing to clean up.
            unsafe { libc::_exit(0) }
        }
        ForkResult::Child => {}
    }

    redirect_std_streams()?;
    umask(Mode::empty());
    chdir("/").map_err(DaemonizeError::ChdirFailed)?;

    let pid_file = match pid_file {
        Some(path) => {
            let mut file = PidFile::new(path);
            file.write_pid(owner)
                .map_err(|e| DaemonizeError::PidFileFailed(errno_of(&e)))?;
            Some(file)
        }
        None => None,
    };

    if let Some(owner) = owner {
        drop_privileges(owner)?;
    }

    Ok(pid_file)
}

fn redirect_std_streams() -> Result<(), DaemonizeError> {
    let dev_null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| DaemonizeError::DevNullFailed(errno_of(&e)))?;

    let fd = dev_null.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup2(fd, target).map_err(DaemonizeError::DevNullFailed)?;
    }
    Ok(())
}

/// Switch to `owner`'s group and user. Only possible, and only attempted,
/// when running as root.
fn drop_privileges(owner: Credentials) -> Result<(), DaemonizeError> {
    if !Uid::current().is_root() {
        debug!("Not running as root, keeping current credentials");
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    nix::unistd::setgroups(&[owner.group()]).map_err(DaemonizeError::PrivilegeDropFailed)?;

    setgid(owner.group()).map_err(DaemonizeError::PrivilegeDropFailed)?;
    setuid(owner.user()).map_err(DaemonizeError::PrivilegeDropFailed)?;

    info!("Dropped privileges to {}", owner);
    Ok(())
}

fn errno_of(e: &io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (File, File) {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        (File::from(rx), File::from(tx))
    }

    #[test]
    fn test_handshake_success() {
        let (mut rx, mut tx) = pipe();
        tx.write_all(&[HANDSHAKE_OK]).unwrap();
        assert_eq!(read_handshake(&mut rx), 0);
    }

    #[test]
    fn test_handshake_stage_failure() {
        let (mut rx, mut tx) = pipe();
        let code = DaemonizeError::PidFileFailed(Errno::EACCES).exit_code();
        tx.write_all(&[code]).unwrap();
        assert_eq!(read_handshake(&mut rx), 23);
    }

    #[test]
    fn test_handshake_closed_without_status() {
        let (mut rx, tx) = pipe();
        drop(tx);
        assert_eq!(read_handshake(&mut rx), 12);
    }

    #[test]
    fn test_handshake_reads_single_byte() {
        let (mut rx, mut tx) = pipe();
        tx.write_all(&[26, 0]).unwrap();
        assert_eq!(read_handshake(&mut rx), 26);
        assert_eq!(read_handshake(&mut rx), 0);
    }

    struct Interrupted;

    impl Read for Interrupted {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EINTR))
        }
    }

    #[test]
    fn test_handshake_interrupted_by_signal() {
        assert_eq!(read_handshake(&mut Interrupted), 12);
    }

    #[test]
    fn test_errno_of() {
        let e = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(errno_of(&e), Errno::EACCES);

        let custom = io::Error::new(io::ErrorKind::Other, "no errno");
        assert_eq!(errno_of(&custom), Errno::EIO);
    }
}
