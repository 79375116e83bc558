//! Process-level tests of the udaemon-bridge binary.
//!
//! These exercise the daemonization handshake: the invoking process must
//! only exit once the detached daemon is set up, with its exit code telling
//! whether that worked.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, Uid, User};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

const BIN: &str = env!("CARGO_BIN_EXE_udaemon-bridge");

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn read_pid(path: &Path) -> i32 {
    std::fs::read_to_string(path)
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

/// Temp dir the daemon can still use after dropping to `nobody`.
fn shared_temp_dir() -> TempDir {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777)).unwrap();
    dir
}

/// Real uid of a running process.
#[cfg(target_os = "linux")]
fn process_uid(pid: i32) -> u32 {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).unwrap();
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().next())
        .unwrap()
        .parse()
        .unwrap()
}

/// Config pointing at a port nothing listens on, so the bridge keeps
/// retrying in the background.
fn write_unreachable_config(dir: &Path) -> PathBuf {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let path = dir.join("bridge.toml");
    std::fs::write(
        &path,
        format!("max_backoff_secs = 1\n\n[upstream]\naddress = \"{}\"\n", address),
    )
    .unwrap();
    path
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_background_handshake_and_terminate() {
    let dir = shared_temp_dir();
    let pid_file = dir.path().join("bridge.pid");
    let config = write_unreachable_config(dir.path());

    let status = Command::new(BIN)
        .arg("-p")
        .arg(&pid_file)
        .arg("-c")
        .arg(&config)
        .arg("--log-dir")
        .arg(dir.path())
        .stdin(Stdio::null())
        .status()
        .unwrap();

    // The invoking process only returns after the handshake.
    assert!(status.success(), "unexpected exit status: {:?}", status);
    assert!(pid_file.exists());

    let pid = read_pid(&pid_file);
    assert!(kill(Pid::from_raw(pid), None).is_ok(), "daemon is not running");

    kill(Pid::from_raw(pid), Signal::SIGTERM).unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || !pid_file.exists()),
        "pid file was not removed on shutdown"
    );

    let logged = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().starts_with("udaemon-bridge"));
    assert!(logged, "no log file written");
}

#[cfg(target_os = "linux")]
#[test]
fn test_background_daemon_runs_as_nobody_without_user_flag() {
    let dir = shared_temp_dir();
    let pid_file = dir.path().join("bridge.pid");
    let config = write_unreachable_config(dir.path());

    let status = Command::new(BIN)
        .arg("-p")
        .arg(&pid_file)
        .arg("-c")
        .arg(&config)
        .arg("--log-dir")
        .arg(dir.path())
        .stdin(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success(), "unexpected exit status: {:?}", status);

    // Privileges are dropped before the handshake completes.
    let pid = read_pid(&pid_file);
    let uid = process_uid(pid);
    kill(Pid::from_raw(pid), Signal::SIGTERM).unwrap();
    wait_for(Duration::from_secs(5), || !pid_file.exists());

    let expected = if Uid::current().is_root() {
        User::from_name("nobody").unwrap().unwrap().uid.as_raw()
    } else {
        Uid::current().as_raw()
    };
    assert_eq!(uid, expected);
    assert_ne!(uid, 0);
}

#[test]
fn test_pid_file_failure_reported_through_exit_code() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("missing").join("bridge.pid");

    let status = Command::new(BIN)
        .arg("-p")
        .arg(&pid_file)
        .arg("--log-dir")
        .arg(dir.path())
        .stdin(Stdio::null())
        .status()
        .unwrap();

    assert_eq!(status.code(), Some(23));
    assert!(!pid_file.exists());
}

#[test]
fn test_invalid_user_exits_with_error() {
    let dir = TempDir::new().unwrap();

    let output = Command::new(BIN)
        .args(["-f", "-u", "no-such-user-udaemon"])
        .arg("-p")
        .arg(dir.path().join("bridge.pid"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no-such-user-udaemon"));
}

#[test]
fn test_foreground_bridge_connects_and_stops_on_terminate() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let config = dir.path().join("bridge.toml");
    std::fs::write(
        &config,
        format!(
            "greeting = \"ping\"\n\n[upstream]\naddress = \"{}\"\n",
            listener.local_addr().unwrap()
        ),
    )
    .unwrap();

    let mut child = Command::new(BIN)
        .args(["-f", "-d"])
        .arg("-c")
        .arg(&config)
        .arg("-p")
        .arg(dir.path().join("bridge.pid"))
        .env("RUST_LOG", "debug")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let (mut upstream, _) = listener.accept().unwrap();
    upstream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut greeting = [0u8; 5];
    upstream.read_exact(&mut greeting).unwrap();
    assert_eq!(&greeting, b"ping\n");
    upstream.write_all(b"some data").unwrap();

    // The loop is running once the event loop logs its start.
    let stderr = child.stderr.take().unwrap();
    let mut lines = BufReader::new(stderr).lines();
    let mut received = false;
    for line in lines.by_ref() {
        let line = line.unwrap();
        if line.contains("Read 9 bytes from server") {
            received = true;
            break;
        }
    }
    assert!(received, "bridge never reported the received data");

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    // Keep draining so the child never blocks on a full pipe.
    let drain = thread::spawn(move || lines.map_while(Result::ok).count());

    let status = child.wait().unwrap();
    assert!(status.success(), "unexpected exit status: {:?}", status);
    drain.join().unwrap();
    assert!(!dir.path().join("bridge.pid").exists());
}
