//! Test-only helpers: scripted launchers and throwaway supervisor setups.
//!
//! Workers are real processes. The "launcher" is a small `/bin/sh` script
//! standing in for the spawning helper, so tests exercise the same
//! spawn/pipe/signal paths as production without needing `spawn-fcgi`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::io::config::{ProxyConfig, SupervisorConfig};
use crate::io::store::RegistryStore;
use crate::reactor::Reactor;
use crate::supervisor::Supervisor;

/// Worker that runs until signalled.
pub const SLEEPING_WORKER: &str = "exec sleep 30";

/// Worker that prints a line and exits non-zero straight away.
pub const CRASHING_WORKER: &str = "echo \"worker on port $5 giving up\"; exit 3";

/// Worker that closes its output straight away but keeps running.
pub const SILENT_WORKER: &str = "exec >/dev/null 2>&1; exec sleep 30";

/// Worker that ignores SIGTERM and only dies to SIGKILL.
pub const STUBBORN_WORKER: &str = "trap '' TERM; exec sleep 30";

/// Temporary directory holding a launcher script, registry, and proxy output.
pub struct Sandbox {
    pub dir: TempDir,
    pub config: SupervisorConfig,
}

impl Sandbox {
    /// Sandbox whose launcher runs `worker` (a shell snippet).
    ///
    /// The launcher records its argv in `launcher.args` before running `worker`.
    pub fn new(worker: &str) -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let launcher = dir.path().join("launcher.sh");
        let args_path = dir.path().join("launcher.args");
        write_script(
            &launcher,
            &format!("printf '%s\\n' \"$*\" > '{}'\n{worker}\n", args_path.display()),
        )?;
        let config = sandbox_config(dir.path(), launcher);
        Ok(Self { dir, config })
    }

    /// Sandbox whose launcher binary does not exist.
    pub fn missing_launcher() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let launcher = dir.path().join("no-such-launcher");
        let config = sandbox_config(dir.path(), launcher);
        Ok(Self { dir, config })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create (if needed) and return an app directory inside the sandbox.
    pub fn app_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.path().join("apps").join(name);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(dir)
    }

    /// Argv the launcher script saw on its most recent run.
    pub fn last_launch_args(&self) -> Result<String> {
        let path = self.path().join("launcher.args");
        let args =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(args.trim().to_string())
    }

    pub fn open_store(&self) -> Result<RegistryStore> {
        RegistryStore::open(&self.config.registry_path)
    }

    /// Supervisor over this sandbox's registry, registering into `reactor`.
    pub fn supervisor(&self, reactor: &Reactor<Supervisor>) -> Result<Supervisor> {
        Supervisor::load(self.config.clone(), self.open_store()?, reactor.handle())
    }
}

fn sandbox_config(root: &Path, launcher: PathBuf) -> SupervisorConfig {
    SupervisorConfig {
        socket_path: root.join("control.sock"),
        registry_path: root.join("apps.toml"),
        pidfile: None,
        base_port: 9500,
        max_retries: 5,
        stop_timeout_secs: 1,
        stop_poll_interval_ms: 20,
        poll_interval_ms: 10,
        launcher,
        interpreter: PathBuf::from("python3"),
        server_entry: PathBuf::from("server.py"),
        default_user: None,
        proxy: ProxyConfig {
            output_dir: Some(root.join("nginx")),
            template: None,
        },
    }
}

/// Write an executable `/bin/sh` script.
pub fn write_script(path: &Path, body: &str) -> Result<()> {
    fs::write(path, format!("#!/bin/sh\n{body}"))
        .with_context(|| format!("write {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

/// Turn `reactor` until `done` holds or `max_turns` pass; returns whether it held.
pub fn turn_until(
    reactor: &mut Reactor<Supervisor>,
    supervisor: &mut Supervisor,
    max_turns: usize,
    done: impl Fn(&Supervisor) -> bool,
) -> Result<bool> {
    for _ in 0..max_turns {
        if done(supervisor) {
            return Ok(true);
        }
        reactor.turn(supervisor)?;
    }
    Ok(done(supervisor))
}
