//! App registry: owns every [`App`], allocates ports, persists
//! registrations, and carries out control commands.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::{error, info, instrument, warn};

use crate::app::{App, AppEnv};
use crate::core::ident::{AppId, path_within};
use crate::core::ports::next_free_port;
use crate::core::protocol::Command;
use crate::core::status::render_list;
use crate::error::{SupervisorError, SupervisorResult};
use crate::io::config::SupervisorConfig;
use crate::io::proxy::{ProxyLocation, ProxyWriter};
use crate::io::store::{RegistryStore, Section};
use crate::reactor::ReactorHandle;

type AppOp = fn(&mut App, &mut AppEnv<'_>) -> SupervisorResult<()>;

pub struct Supervisor {
    apps: BTreeMap<String, App>,
    store: RegistryStore,
    reactor: ReactorHandle<Supervisor>,
    config: SupervisorConfig,
    proxy: ProxyWriter,
}

impl Supervisor {
    /// Build from the persisted registry. Sections missing `path` or `port`
    /// (or reusing a port) are skipped with a warning.
    pub fn load(
        config: SupervisorConfig,
        store: RegistryStore,
        reactor: ReactorHandle<Supervisor>,
    ) -> Result<Self> {
        let proxy = ProxyWriter::new(&config.proxy)?;
        let mut apps = BTreeMap::new();
        let mut ports = HashSet::new();
        for (name, section) in store.sections() {
            let app = match App::from_section(name, section) {
                Ok(app) => app,
                Err(err) => {
                    warn!(app = name, err = %err, "skipping registry section");
                    continue;
                }
            };
            if !ports.insert(app.port()) {
                warn!(app = name, port = app.port(), "port already taken, skipping registry section");
                continue;
            }
            apps.insert(name.to_string(), app);
        }
        info!(apps = apps.len(), registry = %store.path().display(), "registry loaded");
        Ok(Self {
            apps,
            store,
            reactor,
            config,
            proxy,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.get(name)
    }

    pub fn apps(&self) -> impl Iterator<Item = &App> {
        self.apps.values()
    }

    /// Smallest free port at or above the configured base.
    pub fn next_free_port(&self) -> Option<u16> {
        next_free_port(self.apps.values().map(App::port), self.config.base_port)
    }

    /// Resolve an identifier to a registered app name.
    ///
    /// Name matches win; path matches pick the deepest app directory that
    /// contains the given path.
    pub fn resolve(&self, id: &AppId) -> SupervisorResult<String> {
        let by_name = self
            .apps
            .values()
            .find(|app| !matches!(id, AppId::Path(_)) && id.matches(app.name(), app.path()));
        let found = match (by_name, id) {
            (Some(app), _) => Some(app),
            (None, AppId::Path(path)) => self.find_by_path(path),
            (None, _) => id.fallback_path().and_then(|path| self.find_by_path(path)),
        };
        found
            .map(|app| app.name().to_string())
            .ok_or_else(|| SupervisorError::InvalidArgument(format!("Unknown app {id}")))
    }

    fn find_by_path(&self, path: &Path) -> Option<&App> {
        self.apps
            .values()
            .filter(|app| path_within(path, app.path()))
            .max_by_key(|app| app.path().components().count())
    }

    /// Persist a new app with the next free port and write its proxy location.
    #[instrument(skip_all, fields(app = name))]
    pub fn register(&mut self, name: &str, path: &str) -> SupervisorResult<String> {
        validate_name(name)?;
        if path.is_empty() {
            return Err(SupervisorError::InvalidArgument(
                "App path must not be empty".to_string(),
            ));
        }
        if self.apps.contains_key(name) || self.store.has_section(name) {
            return Err(SupervisorError::AlreadyExists(format!(
                "App {name} is already registered"
            )));
        }
        let port = self
            .next_free_port()
            .ok_or_else(|| anyhow!("no free port at or above {}", self.config.base_port))?;

        let section = Section::from([
            ("path".to_string(), path.to_string()),
            ("port".to_string(), port.to_string()),
        ]);
        self.store.set_section(name, section)?;
        let app = App::new(name, PathBuf::from(path), port);
        self.apps.insert(name.to_string(), app);
        info!(port, "app registered");

        let location = ProxyLocation {
            name,
            path: Path::new(path),
            port,
        };
        match self.proxy.write(&location).map_err(proxy_error)? {
            Some(written) => Ok(format!("Configuration written to {}", written.display())),
            None => Ok("No proxy configuration written".to_string()),
        }
    }

    /// Stop the app if running, then forget it (registry section and proxy file).
    #[instrument(skip_all, fields(id = %id))]
    pub fn unregister(&mut self, id: &AppId) -> SupervisorResult<()> {
        let name = self.resolve(id)?;
        self.with_app(&name, App::stop)?;
        self.store.remove_section(&name)?;
        self.apps.remove(&name);
        if let Err(err) = self.proxy.remove(&name) {
            warn!(app = %name, err = %err, "failed to remove proxy location");
        }
        info!(app = %name, "app unregistered");
        Ok(())
    }

    pub fn start(&mut self, id: &AppId) -> SupervisorResult<()> {
        self.apply(id, App::start)
    }

    pub fn stop(&mut self, id: &AppId) -> SupervisorResult<()> {
        self.apply(id, App::stop)
    }

    pub fn restart(&mut self, id: &AppId) -> SupervisorResult<()> {
        self.apply(id, App::restart)
    }

    pub fn enable(&mut self, id: &AppId) -> SupervisorResult<()> {
        self.apply(id, App::enable)
    }

    pub fn disable(&mut self, id: &AppId) -> SupervisorResult<()> {
        self.apply(id, App::disable)
    }

    /// Start every app; one failure does not keep the rest from starting.
    pub fn start_all(&mut self) {
        self.for_each_app("start", App::start);
    }

    /// Stop every running app.
    pub fn stop_all(&mut self) {
        self.for_each_app("stop", App::stop);
    }

    /// `name (status), ...` for every app in name order.
    pub fn list(&self) -> String {
        render_list(
            self.apps
                .iter()
                .map(|(name, app)| (name.as_str(), app.status())),
        )
    }

    /// Carry out one control command; `Ok(Some(result))` becomes `OK <result>`.
    pub fn execute(&mut self, command: Command) -> SupervisorResult<Option<String>> {
        match command {
            Command::Register { name, path } => self.register(&name, &path).map(Some),
            Command::Unregister(id) => self.unregister(&id).map(|()| None),
            Command::Start(id) => self.start(&id).map(|()| None),
            Command::Stop(id) => self.stop(&id).map(|()| None),
            Command::Restart(id) => self.restart(&id).map(|()| None),
            Command::Enable(id) => self.enable(&id).map(|()| None),
            Command::Disable(id) => self.disable(&id).map(|()| None),
            Command::List => Ok(Some(self.list())),
            Command::Quit => Ok(None),
        }
    }

    /// Called by an output watch when its worker's pipe is readable.
    /// Returns `false` once `name` is no longer registered.
    pub(crate) fn observe_exit(&mut self, name: &str, eof: bool) -> bool {
        let Self {
            apps,
            store,
            reactor,
            config,
            ..
        } = self;
        let Some(app) = apps.get_mut(name) else {
            return false;
        };
        let mut env = AppEnv {
            store,
            reactor,
            config,
        };
        app.poll_exit(&mut env, eof);
        true
    }

    /// Check every running worker for an exit. Driven by SIGCHLD.
    pub(crate) fn reap_exited(&mut self) {
        let Self {
            apps,
            store,
            reactor,
            config,
            ..
        } = self;
        let mut env = AppEnv {
            store,
            reactor,
            config,
        };
        for app in apps.values_mut() {
            app.poll_exit(&mut env, false);
        }
    }

    fn apply(&mut self, id: &AppId, op: AppOp) -> SupervisorResult<()> {
        let name = self.resolve(id)?;
        self.with_app(&name, op)
    }

    fn with_app(&mut self, name: &str, op: AppOp) -> SupervisorResult<()> {
        let Self {
            apps,
            store,
            reactor,
            config,
            ..
        } = self;
        let app = apps
            .get_mut(name)
            .ok_or_else(|| SupervisorError::InvalidArgument(format!("Unknown app {name}")))?;
        let mut env = AppEnv {
            store,
            reactor,
            config,
        };
        op(app, &mut env)
    }

    fn for_each_app(&mut self, action: &str, op: AppOp) {
        let names: Vec<String> = self.apps.keys().cloned().collect();
        for name in names {
            if let Err(err) = self.with_app(&name, op) {
                error!(app = %name, action, err = %err, "app action failed");
            }
        }
    }
}

fn validate_name(name: &str) -> SupervisorResult<()> {
    let reserved = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.starts_with("name:")
        || name.starts_with("path:");
    if reserved {
        return Err(SupervisorError::InvalidArgument(format!(
            "Invalid app name \"{name}\""
        )));
    }
    Ok(())
}

fn proxy_error(err: anyhow::Error) -> SupervisorError {
    let denied = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|cause| cause.kind() == io::ErrorKind::PermissionDenied);
    if denied {
        SupervisorError::PermissionDenied(format!("{err:#}"))
    } else {
        SupervisorError::Internal(err)
    }
}
