//! Launching FastCGI workers through the spawning helper, and stopping them.

use std::ffi::OsString;
use std::io::{self, ErrorKind, PipeReader, Read};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Address the workers bind to; only the local reverse proxy talks to them.
pub const BIND_ADDRESS: &str = "127.0.0.1";

/// Everything the spawning helper needs to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub launcher: &'a Path,
    pub port: u16,
    pub user: Option<&'a str>,
    pub interpreter: &'a Path,
    pub executable: &'a Path,
    /// Working directory for the worker, if it exists.
    pub workdir: &'a Path,
}

impl LaunchRequest<'_> {
    /// Helper argv, without the helper itself.
    ///
    /// `-n` keeps the helper in the foreground so the tracked pid is the worker.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-n".into(),
            "-a".into(),
            BIND_ADDRESS.into(),
            "-p".into(),
            self.port.to_string().into(),
        ];
        if let Some(user) = self.user {
            args.push("-u".into());
            args.push(user.into());
        }
        args.push("--".into());
        args.push(self.interpreter.as_os_str().to_os_string());
        args.push(self.executable.as_os_str().to_os_string());
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.launcher);
        cmd.args(self.args());
        if self.workdir.is_dir() {
            cmd.current_dir(self.workdir);
        }
        cmd
    }
}

/// A spawned worker plus the read end of its combined stdout/stderr pipe.
#[derive(Debug)]
pub struct Launched {
    pub child: Child,
    pub output: PipeReader,
}

/// Spawn the helper with stdout and stderr sharing one non-blocking pipe.
///
/// A missing helper binary surfaces as `ErrorKind::NotFound`.
#[instrument(skip_all, fields(port = request.port, launcher = %request.launcher.display()))]
pub fn launch(request: &LaunchRequest<'_>) -> io::Result<Launched> {
    let (output, writer) = io::pipe()?;
    let stderr = writer.try_clone()?;
    set_nonblocking(&output)?;

    let mut cmd = request.command();
    cmd.stdin(Stdio::null()).stdout(writer).stderr(stderr);

    debug!("spawning worker");
    let child = cmd.spawn()?;
    // `cmd` still owns the parent's copies of the write end; dropping it lets
    // the pipe report EOF once the worker exits.
    drop(cmd);
    debug!(pid = child.id(), "worker spawned");
    Ok(Launched { child, output })
}

fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Append everything currently readable from `reader` to `out`.
///
/// Returns `true` once the writer side is closed (EOF). An empty,
/// still-open pipe is not an error.
pub fn read_available<R: Read>(reader: &mut R, out: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Send `signal` to `child`; a process that is already gone is fine.
pub fn signal(child: &Child, signal: Signal) -> io::Result<()> {
    let pid = Pid::from_raw(i32::try_from(child.id()).map_err(io::Error::other)?);
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Wait up to `timeout` for `child` to exit, checking every `poll_interval`.
pub fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
    poll_interval: Duration,
) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        if let Some(status) = child.wait_timeout(poll_interval.min(deadline - now))? {
            return Ok(Some(status));
        }
        debug!(pid = child.id(), "worker still running");
    }
}

/// SIGTERM, wait; SIGKILL, wait. `None` means the worker survived both phases.
#[instrument(skip_all, fields(pid = child.id(), timeout_secs = timeout.as_secs()))]
pub fn terminate(
    child: &mut Child,
    timeout: Duration,
    poll_interval: Duration,
) -> io::Result<Option<ExitStatus>> {
    signal(child, Signal::SIGTERM)?;
    if let Some(status) = wait_for_exit(child, timeout, poll_interval)? {
        return Ok(Some(status));
    }

    warn!("worker ignored SIGTERM, killing");
    signal(child, Signal::SIGKILL)?;
    wait_for_exit(child, timeout, poll_interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_available_distinguishes_empty_and_eof() {
        let (mut reader, mut writer) = io::pipe().expect("pipe");
        set_nonblocking(&reader).expect("nonblocking");
        let mut out = Vec::new();

        assert!(!read_available(&mut reader, &mut out).expect("read empty"));
        assert!(out.is_empty());

        writer.write_all(b"hello\n").expect("write");
        assert!(!read_available(&mut reader, &mut out).expect("read data"));
        assert_eq!(out, b"hello\n");

        drop(writer);
        assert!(read_available(&mut reader, &mut out).expect("read eof"));
    }

    #[test]
    fn terminate_stops_a_sleeping_child() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let status = terminate(
            &mut child,
            Duration::from_secs(2),
            Duration::from_millis(50),
        )
        .expect("terminate");
        assert!(status.is_some_and(|status| !status.success()));
    }

    #[test]
    fn signalling_an_exited_child_is_tolerated() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        std::thread::sleep(Duration::from_millis(200));
        signal(&child, Signal::SIGTERM).expect("signal exited child");
        assert!(child.wait().expect("wait").success());
    }

    #[test]
    fn args_bind_localhost_and_pass_worker() {
        let request = LaunchRequest {
            launcher: Path::new("spawn-fcgi"),
            port: 9501,
            user: Some("www-data"),
            interpreter: Path::new("/apps/foo/venv/bin/python"),
            executable: Path::new("/apps/foo/server.py"),
            workdir: Path::new("/apps/foo"),
        };
        let args: Vec<String> = request
            .args()
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-n",
                "-a",
                "127.0.0.1",
                "-p",
                "9501",
                "-u",
                "www-data",
                "--",
                "/apps/foo/venv/bin/python",
                "/apps/foo/server.py",
            ]
        );
    }

    #[test]
    fn missing_launcher_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let launcher = temp.path().join("no-such-helper");
        let request = LaunchRequest {
            launcher: &launcher,
            port: 9500,
            user: None,
            interpreter: Path::new("python3"),
            executable: Path::new("server.py"),
            workdir: temp.path(),
        };
        let err = launch(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
