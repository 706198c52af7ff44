//! Pidfile for the running supervisor.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::io::config::write_atomic;

/// Atomically write the current process id to `path`.
pub fn write_pidfile(path: &Path) -> Result<()> {
    let pid = std::process::id();
    write_atomic(path, &format!("{pid}\n"))
        .with_context(|| format!("write pidfile {}", path.display()))?;
    debug!(path = %path.display(), pid, "pidfile written");
    Ok(())
}

/// Pid recorded in `path` if that process is still alive.
///
/// Unreadable or stale pidfiles yield `None`.
pub fn running_pid(path: &Path) -> Option<u32> {
    let pid = read_pidfile(path).ok()?;
    let raw = i32::try_from(pid).ok()?;
    kill(Pid::from_raw(raw), None::<Signal>).ok().map(|()| pid)
}

fn read_pidfile(path: &Path) -> Result<u32> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read pidfile {}", path.display()))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("parse pidfile {}", path.display()))
}

/// Remove the pidfile; a missing file is fine.
pub fn remove_pidfile(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "pidfile removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), err = %err, "failed to remove pidfile"),
    }
}
