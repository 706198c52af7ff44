//! CLI tests: spawn the fcgivisor binary and check exit codes and output.

use std::path::Path;
use std::process::{Child, Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use wait_timeout::ChildExt;

use fcgivisor::exit_codes;
use fcgivisor::io::config::{SupervisorConfig, load_config, write_config};

fn fcgivisor(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fcgivisor"))
        .args(args)
        .output()
        .expect("run fcgivisor")
}

fn wait_for(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn terminate(child: &mut Child) -> Option<i32> {
    let pid = Pid::from_raw(i32::try_from(child.id()).expect("pid"));
    kill(pid, Signal::SIGTERM).expect("signal serve");
    child
        .wait_timeout(Duration::from_secs(10))
        .expect("wait serve")
        .and_then(|status| status.code())
}

#[test]
fn init_writes_default_config_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("etc/fcgivisor.toml");
    let config_arg = config.to_str().expect("utf8 path");

    let output = fcgivisor(&["init", "--config", config_arg]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&config).expect("load"), SupervisorConfig::default());

    let output = fcgivisor(&["init", "--config", config_arg]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("already exists"));

    let output = fcgivisor(&["init", "--config", config_arg, "--force"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
}

#[test]
fn ctl_without_supervisor_is_unreachable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let socket = temp.path().join("missing.sock");
    let config = temp.path().join("missing.toml");
    let output = fcgivisor(&[
        "ctl",
        "--config",
        config.to_str().expect("utf8 path"),
        "--socket",
        socket.to_str().expect("utf8 path"),
        "list",
    ]);
    assert_eq!(output.status.code(), Some(exit_codes::UNREACHABLE));
}

#[test]
fn serve_answers_ctl_and_shuts_down_on_sigterm() {
    let temp = tempfile::tempdir().expect("tempdir");
    let socket = temp.path().join("control.sock");
    let pidfile = temp.path().join("fcgivisor.pid");
    let config = temp.path().join("fcgivisor.toml");
    write_config(
        &config,
        &SupervisorConfig {
            socket_path: socket.clone(),
            registry_path: temp.path().join("apps.toml"),
            pidfile: Some(pidfile.clone()),
            ..SupervisorConfig::default()
        },
    )
    .expect("write config");
    let config_arg = config.to_str().expect("utf8 path");

    let mut serve = Command::new(env!("CARGO_BIN_EXE_fcgivisor"))
        .args(["serve", "--config", config_arg])
        .spawn()
        .expect("spawn serve");
    assert!(wait_for(&socket, Duration::from_secs(10)), "socket never appeared");
    assert!(pidfile.exists());

    let output = fcgivisor(&["ctl", "--config", config_arg, "list"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "OK \n");

    let output = fcgivisor(&["ctl", "--config", config_arg, "frobnicate"]);
    assert_eq!(output.status.code(), Some(exit_codes::COMMAND_FAILED));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "ERROR 95 Unknown command \"frobnicate\"\n"
    );

    let output = fcgivisor(&["ctl", "--config", config_arg, "register", "foo", "/apps/foo"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "OK No proxy configuration written\n"
    );

    assert_eq!(terminate(&mut serve), Some(exit_codes::OK));
    assert!(!socket.exists());
    assert!(!pidfile.exists());
    assert!(
        std::fs::read_to_string(temp.path().join("apps.toml"))
            .expect("registry")
            .contains("[foo]")
    );
}
