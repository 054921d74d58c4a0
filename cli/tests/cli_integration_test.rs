use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

/// Host port unlikely to collide with other test processes
fn test_port(offset: u16) -> u16 {
    30000 + (std::process::id() % 10000) as u16 * 3 + offset
}

/// Start the simulator with `listener` as its only server fd
fn spawn_simulator(listener: &UnixListener, port: u16, dir: &Path) -> Child {
    let fd = listener.as_raw_fd();
    let mut command = Command::new(env!("CARGO_BIN_EXE_modem_simulator"));
    command
        .arg(format!("--server_fds={}", fd))
        .arg(format!("--host_port={}", port))
        .arg(format!("--instance_dir={}", dir.display()))
        .arg("--timezone_file=/nonexistent")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: only async-signal-safe fcntl runs between fork and exec
    unsafe {
        command.pre_exec(move || inherit_fd(fd));
    }
    command.spawn().expect("Failed to start modem_simulator")
}

fn inherit_fd(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn connect_monitor(port: u16) -> UnixStream {
    let name = format!("modem_simulator{}", port);
    let addr = SocketAddr::from_abstract_name(&name).expect("Invalid socket name");
    let deadline = Instant::now() + WAIT;
    loop {
        match UnixStream::connect_addr(&addr) {
            Ok(stream) => return stream,
            Err(e) => {
                assert!(Instant::now() < deadline, "monitor @{} never came up: {}", name, e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn wait_exit(child: &mut Child) -> ExitStatus {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(status) = child.try_wait().expect("Failed to poll child") {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("modem_simulator did not exit");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Read from `stream` until the text received contains `needle`
fn read_until(stream: &mut UnixStream, needle: &str) -> String {
    stream
        .set_read_timeout(Some(WAIT))
        .expect("Failed to set timeout");
    let mut text = String::new();
    let mut buf = [0u8; 256];
    while !text.contains(needle) {
        let n = stream.read(&mut buf).expect("read failed");
        assert!(n > 0, "connection closed before {:?}, got {:?}", needle, text);
        text.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    text
}

#[test]
fn test_ril_session_and_stop() {
    let dir = TempDir::new().expect("Failed to create instance dir");
    let listener = UnixListener::bind(dir.path().join("ril.sock")).expect("Failed to bind");
    let port = test_port(0);
    let mut child = spawn_simulator(&listener, port, dir.path());

    let mut monitor = connect_monitor(port);

    let mut ril = UnixStream::connect(dir.path().join("ril.sock")).expect("Failed to connect RIL");
    ril.write_all(b"AT+CGSN\r").unwrap();
    let reply = read_until(&mut ril, "OK\r");
    assert!(reply.contains("OK\r"), "unexpected reply {:?}", reply);

    monitor.write_all(b"STOP").unwrap();
    let mut ack = [0u8; 2];
    monitor
        .set_read_timeout(Some(WAIT))
        .expect("Failed to set timeout");
    monitor.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"OK");

    let status = wait_exit(&mut child);
    assert!(status.success(), "exit status {:?}", status);
    assert!(dir.path().join("modem_nvram.json").exists());
    assert!(dir.path().join("iccprofile_for_sim0.xml").exists());
}

#[test]
fn test_unknown_token_keeps_running() {
    let dir = TempDir::new().expect("Failed to create instance dir");
    let listener = UnixListener::bind(dir.path().join("ril.sock")).expect("Failed to bind");
    let port = test_port(1);
    let mut child = spawn_simulator(&listener, port, dir.path());

    let mut bogus = connect_monitor(port);
    bogus.write_all(b"XXXX").unwrap();
    bogus
        .set_read_timeout(Some(WAIT))
        .expect("Failed to set timeout");
    let mut buf = [0u8; 8];
    assert_eq!(bogus.read(&mut buf).unwrap_or(0), 0);

    let mut monitor = connect_monitor(port);
    monitor.write_all(b"STOP").unwrap();
    let status = wait_exit(&mut child);
    assert!(status.success(), "exit status {:?}", status);
}

#[test]
fn test_bad_server_fd_exits_with_two() {
    let dir = TempDir::new().expect("Failed to create instance dir");
    let status = Command::new(env!("CARGO_BIN_EXE_modem_simulator"))
        .arg("--server_fds=987")
        .arg(format!("--host_port={}", test_port(2)))
        .arg(format!("--instance_dir={}", dir.path().display()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("Failed to run modem_simulator");
    assert_eq!(status.code(), Some(2));
}

#[test]
fn test_missing_server_fds_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_modem_simulator"))
        .output()
        .expect("Failed to run modem_simulator");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--server_fds"), "stderr: {}", stderr);
}
