//! One supervised FastCGI app and its worker lifecycle.
//!
//! An [`App`] is `Idle` (no controller) or `Running` (controller present,
//! worker alive or exit pending). Starting registers an [`OutputWatch`] for
//! the worker's output pipe; when the watch sees the worker exit, the app
//! either restarts it (bounded by `max_retries`) or, if the exit was
//! requested through [`App::stop`], settles back to `Idle`.

use std::cell::Cell;
use std::io::{self, ErrorKind, PipeReader};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::protocol::take_lines;
use crate::core::restart::{ExitAction, after_unexpected_exit};
use crate::core::status::AppStatus;
use crate::error::{SupervisorError, SupervisorResult};
use crate::io::config::SupervisorConfig;
use crate::io::process::{self, LaunchRequest};
use crate::io::store::{RegistryStore, Section};
use crate::reactor::{EventHandle, ReactorHandle};
use crate::supervisor::Supervisor;

/// How long to wait for the exit status once the output pipe hit EOF.
const EOF_EXIT_GRACE: Duration = Duration::from_millis(50);

/// Self-contained environments looked up under the app directory, in order.
const BUNDLED_INTERPRETERS: [&str; 2] = ["venv/bin/python", "bin/python"];

/// Collaborators an app needs while changing state.
pub struct AppEnv<'a> {
    pub store: &'a mut RegistryStore,
    pub reactor: &'a ReactorHandle<Supervisor>,
    pub config: &'a SupervisorConfig,
}

#[derive(Debug)]
pub struct App {
    name: String,
    path: PathBuf,
    port: u16,
    user: Option<String>,
    disabled: bool,
    retry_count: u32,
    stopping: bool,
    last_exit: Option<ExitStatus>,
    controller: Option<Controller>,
}

/// Live worker owned by an app. Shares its closed flag with the
/// [`OutputWatch`] registered for the same worker.
#[derive(Debug)]
struct Controller {
    child: Option<Child>,
    pid: u32,
    closed: Rc<Cell<bool>>,
}

impl Controller {
    fn close(&mut self) {
        if self.closed.replace(true) {
            return;
        }
        self.child = None;
    }
}

impl App {
    pub fn new(name: &str, path: PathBuf, port: u16) -> Self {
        Self {
            name: name.to_string(),
            path,
            port,
            user: None,
            disabled: false,
            retry_count: 0,
            stopping: false,
            last_exit: None,
            controller: None,
        }
    }

    /// Build from a registry section; `path` and `port` are required.
    pub fn from_section(name: &str, section: &Section) -> Result<Self> {
        let path = section
            .get("path")
            .filter(|path| !path.is_empty())
            .ok_or_else(|| anyhow!("missing path"))?;
        let port = section
            .get("port")
            .ok_or_else(|| anyhow!("missing port"))?
            .parse::<u16>()
            .context("invalid port")?;
        let mut app = Self::new(name, PathBuf::from(path), port);
        app.user = section.get("user").filter(|user| !user.is_empty()).cloned();
        app.disabled = section.get("disabled").is_some_and(|value| parse_flag(value));
        Ok(app)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.controller.as_ref().map(|controller| controller.pid)
    }

    /// Exit status of the most recently reaped worker.
    pub fn last_exit(&self) -> Option<ExitStatus> {
        self.last_exit
    }

    pub fn status(&self) -> AppStatus {
        match self.pid() {
            Some(pid) => AppStatus::Running {
                pid,
                port: self.port,
            },
            None if self.disabled => AppStatus::Disabled,
            None => AppStatus::Stopped,
        }
    }

    pub fn server_executable_path(&self, server_entry: &Path) -> PathBuf {
        self.path.join(server_entry)
    }

    /// Bundled interpreter under the app directory, else `default`.
    pub fn interpreter_path(&self, default: &Path) -> PathBuf {
        BUNDLED_INTERPRETERS
            .iter()
            .map(|relative| self.path.join(relative))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| default.to_path_buf())
    }

    /// Launch the worker. No-op when disabled or already running.
    #[instrument(skip_all, fields(app = %self.name, port = self.port))]
    pub fn start(&mut self, env: &mut AppEnv<'_>) -> SupervisorResult<()> {
        if self.disabled {
            debug!("app disabled, not starting");
            return Ok(());
        }
        if self.controller.is_some() {
            debug!("already running");
            return Ok(());
        }

        let interpreter = self.interpreter_path(&env.config.interpreter);
        let executable = self.server_executable_path(&env.config.server_entry);
        let request = LaunchRequest {
            launcher: &env.config.launcher,
            port: self.port,
            user: self.user.as_deref().or(env.config.default_user.as_deref()),
            interpreter: &interpreter,
            executable: &executable,
            workdir: &self.path,
        };
        let launched = process::launch(&request).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                SupervisorError::NotFound(format!(
                    "Launcher {} not found",
                    env.config.launcher.display()
                ))
            } else {
                SupervisorError::Io(err)
            }
        })?;

        let pid = launched.child.id();
        let closed = Rc::new(Cell::new(false));
        env.reactor.register(OutputWatch {
            app: self.name.clone(),
            output: launched.output,
            closed: Rc::clone(&closed),
            drained: false,
            partial: Vec::new(),
        });
        self.controller = Some(Controller {
            child: Some(launched.child),
            pid,
            closed,
        });
        info!(pid, "worker started");
        Ok(())
    }

    /// Terminate the worker: SIGTERM, then SIGKILL, each phase bounded by
    /// `stop_timeout`. Blocks the calling thread. No-op when not running.
    ///
    /// A worker that survives both phases is left running and tracked; the
    /// failure is logged and no further action is taken.
    #[instrument(skip_all, fields(app = %self.name))]
    pub fn stop(&mut self, env: &mut AppEnv<'_>) -> SupervisorResult<()> {
        let Some(child) = self
            .controller
            .as_mut()
            .and_then(|controller| controller.child.as_mut())
        else {
            return Ok(());
        };
        self.stopping = true;

        let outcome = process::terminate(
            child,
            env.config.stop_timeout(),
            env.config.stop_poll_interval(),
        );
        self.settle_stop(env, outcome)
    }

    /// Apply the result of a termination attempt.
    fn settle_stop(
        &mut self,
        env: &mut AppEnv<'_>,
        outcome: io::Result<Option<ExitStatus>>,
    ) -> SupervisorResult<()> {
        match outcome {
            Ok(Some(status)) => {
                self.record_exit(status);
                self.close_controller(env);
            }
            Ok(None) => error!(
                pid = ?self.pid(),
                "worker survived SIGTERM and SIGKILL, giving up"
            ),
            Err(err) => {
                // Still supervised: a later exit must count as a crash.
                self.stopping = false;
                error!(pid = ?self.pid(), err = %err, "failed to stop worker");
                return Err(err.into());
            }
        }
        Ok(())
    }

    pub fn restart(&mut self, env: &mut AppEnv<'_>) -> SupervisorResult<()> {
        self.stop(env)?;
        self.start(env)
    }

    /// Stop the worker and persist `disabled = true`.
    pub fn disable(&mut self, env: &mut AppEnv<'_>) -> SupervisorResult<()> {
        if self.disabled {
            return Ok(());
        }
        self.stop(env)?;
        env.store.set(&self.name, "disabled", "true")?;
        self.disabled = true;
        info!(app = %self.name, "app disabled");
        Ok(())
    }

    /// Clear the persisted disabled flag and the retry counter. Does not start.
    pub fn enable(&mut self, env: &mut AppEnv<'_>) -> SupervisorResult<()> {
        if !self.disabled {
            return Ok(());
        }
        env.store.remove_option(&self.name, "disabled")?;
        self.retry_count = 0;
        self.disabled = false;
        info!(app = %self.name, "app enabled");
        Ok(())
    }

    /// Check whether the worker has exited and react if it has.
    ///
    /// `eof` means the output pipe just closed, so an exit is likely and
    /// worth waiting for briefly. The output watch retires after that one
    /// call; later exits arrive through the child reaper.
    pub(crate) fn poll_exit(&mut self, env: &mut AppEnv<'_>, eof: bool) {
        let Some(child) = self
            .controller
            .as_mut()
            .and_then(|controller| controller.child.as_mut())
        else {
            return;
        };
        let waited = if eof {
            child.wait_timeout(EOF_EXIT_GRACE)
        } else {
            child.try_wait()
        };
        match waited {
            Ok(Some(status)) => {
                self.record_exit(status);
                self.close_controller(env);
            }
            Ok(None) => {}
            Err(err) => warn!(app = %self.name, err = %err, "failed to check worker status"),
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        match (status.code(), status.signal()) {
            (Some(code), _) => info!(app = %self.name, exit_code = code, "worker exited"),
            (None, Some(signal)) => info!(app = %self.name, signal, "worker killed by signal"),
            (None, None) => info!(app = %self.name, "worker exited"),
        }
        self.last_exit = Some(status);
    }

    fn close_controller(&mut self, env: &mut AppEnv<'_>) {
        let Some(mut controller) = self.controller.take() else {
            return;
        };
        controller.close();
        self.controller_closed(env);
    }

    /// React to the worker being gone: deliberate stops settle, unexpected
    /// exits restart until the retry budget is spent, then disable.
    fn controller_closed(&mut self, env: &mut AppEnv<'_>) {
        if self.stopping {
            self.stopping = false;
            self.retry_count = 0;
            debug!(app = %self.name, "worker stopped on request");
            return;
        }

        self.retry_count += 1;
        match after_unexpected_exit(self.retry_count, env.config.max_retries) {
            ExitAction::Restart => {
                warn!(
                    app = %self.name,
                    retry = self.retry_count,
                    max_retries = env.config.max_retries,
                    "worker exited unexpectedly, restarting"
                );
                if let Err(err) = self.start(env) {
                    error!(app = %self.name, err = %err, "restart failed");
                }
            }
            ExitAction::Disable => {
                error!(
                    app = %self.name,
                    retry = self.retry_count,
                    "worker keeps exiting, disabling app"
                );
                if let Err(err) = self.disable(env) {
                    error!(app = %self.name, err = %err, "failed to persist disabled flag");
                }
            }
        }
    }
}

/// Registry boolean: `true`/`yes`/`on`/`1`, case-insensitive.
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

/// Reactor-side view of a worker: drains and logs its combined output and
/// asks the supervisor to check for exit whenever the pipe is readable.
///
/// The watch retires once the pipe reaches EOF. A worker that closed its
/// output but keeps running is then reaped through [`ChildReaper`].
///
/// [`ChildReaper`]: crate::reaper::ChildReaper
pub struct OutputWatch {
    app: String,
    output: PipeReader,
    closed: Rc<Cell<bool>>,
    drained: bool,
    partial: Vec<u8>,
}

impl OutputWatch {
    fn log_output(&mut self, flush: bool) {
        for line in take_lines(&mut self.partial) {
            if !line.is_empty() {
                info!(app = %self.app, "{line}");
            }
        }
        if flush && !self.partial.is_empty() {
            let rest = String::from_utf8_lossy(&self.partial).trim().to_string();
            info!(app = %self.app, "{rest}");
            self.partial.clear();
        }
    }
}

impl EventHandle<Supervisor> for OutputWatch {
    fn fd(&self) -> BorrowedFd<'_> {
        self.output.as_fd()
    }

    fn is_closed(&self) -> bool {
        self.drained || self.closed.get()
    }

    fn on_readable(&mut self, supervisor: &mut Supervisor) {
        let eof = match process::read_available(&mut self.output, &mut self.partial) {
            Ok(eof) => eof,
            Err(err) => {
                warn!(app = %self.app, err = %err, "failed to read worker output");
                true
            }
        };
        self.log_output(eof);
        if !supervisor.observe_exit(&self.app, eof) {
            debug!(app = %self.app, "app no longer registered, dropping output watch");
            self.closed.set(true);
            return;
        }
        if eof {
            if !self.closed.get() {
                debug!(app = %self.app, "worker closed its output, waiting for SIGCHLD");
            }
            self.drained = true;
        }
    }

    fn label(&self) -> String {
        format!("output:{}", self.app)
    }
}
