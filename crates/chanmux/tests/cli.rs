#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/chanmux-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_socket(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

fn run_listen_and_send(secure: bool) {
    let dir = unique_temp_dir(if secure { "secure" } else { "plain" });
    let sock_path = dir.join("listen.sock");

    let mut listen = Command::new(env!("CARGO_BIN_EXE_chanmux"));
    listen
        .arg("--format")
        .arg("json")
        .arg("--log-level")
        .arg("off")
        .arg("listen")
        .arg(&sock_path)
        .arg("--count")
        .arg("2");
    if secure {
        listen.arg("--secure");
    }
    let child = listen
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("listen should start");
    assert!(
        wait_for_socket(&sock_path, Duration::from_secs(5)),
        "listen socket should appear"
    );

    let mut send = Command::new(env!("CARGO_BIN_EXE_chanmux"));
    send.arg("--format")
        .arg("json")
        .arg("--log-level")
        .arg("off")
        .arg("send")
        .arg(&sock_path)
        .arg("first")
        .arg("second");
    if secure {
        send.arg("--secure");
    }
    let output = send.output().expect("send should run");
    assert!(output.status.success(), "send failed: {output:?}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let echoes: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("send should emit json lines"))
        .collect();
    assert_eq!(echoes.len(), 2);
    assert_eq!(echoes[0]["text"], "first");
    assert_eq!(echoes[1]["text"], "second");
    assert_eq!(echoes[1]["seq"], 1);
    assert_eq!(echoes[0]["direction"], "echoed");

    let listened = child.wait_with_output().expect("listen should exit");
    assert_eq!(listened.status.code(), Some(0));
    let received = String::from_utf8_lossy(&listened.stdout);
    assert_eq!(received.lines().count(), 2);
    assert!(received.contains("\"direction\":\"received\""));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn listen_echoes_send_messages() {
    run_listen_and_send(false);
}

#[test]
fn listen_echoes_send_messages_over_secure_connection() {
    run_listen_and_send(true);
}

#[test]
fn send_to_missing_socket_is_transport_error() {
    let dir = unique_temp_dir("missing");
    let output = Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("send")
        .arg(dir.join("nobody.sock"))
        .arg("hello")
        .output()
        .expect("send should run");

    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_timeout_is_usage_error() {
    let dir = unique_temp_dir("usage");
    let output = Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("send")
        .arg(dir.join("any.sock"))
        .arg("hello")
        .arg("--timeout")
        .arg("0s")
        .output()
        .expect("send should run");

    assert_eq!(output.status.code(), Some(64));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_reports_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}
