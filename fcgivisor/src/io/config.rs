//! Supervisor configuration stored as TOML (default `/etc/fcgivisor.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fcgivisor.toml";

/// Supervisor configuration (TOML).
///
/// Missing fields default to values suitable for a system-wide install.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Unix socket the control protocol listens on.
    pub socket_path: PathBuf,

    /// Persisted app registry (one table per app).
    pub registry_path: PathBuf,

    /// Write the supervisor pid here while `serve` runs.
    pub pidfile: Option<PathBuf>,

    /// First port handed out by `register`.
    pub base_port: u16,

    /// Consecutive unexpected exits tolerated before an app is disabled.
    pub max_retries: u32,

    /// Length of each termination phase (SIGTERM, then SIGKILL).
    pub stop_timeout_secs: u64,

    /// How often to check for exit inside a termination phase.
    pub stop_poll_interval_ms: u64,

    /// Reactor poll timeout; bounds how long a stop request goes unnoticed.
    pub poll_interval_ms: u16,

    /// FastCGI spawning helper, resolved via `PATH` when not absolute.
    pub launcher: PathBuf,

    /// Interpreter used when the app carries no environment of its own.
    pub interpreter: PathBuf,

    /// Worker entry point, relative to the app directory.
    pub server_entry: PathBuf,

    /// Run-as user for apps whose registry section has no `user`.
    pub default_user: Option<String>,

    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Directory receiving `<name>.conf` location files. Unset disables generation.
    pub output_dir: Option<PathBuf>,

    /// minijinja template replacing the built-in nginx `location` block.
    pub template: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/fcgivisor/control.sock"),
            registry_path: PathBuf::from("/var/lib/fcgivisor/apps.toml"),
            pidfile: None,
            base_port: 9500,
            max_retries: 5,
            stop_timeout_secs: 5,
            stop_poll_interval_ms: 1000,
            poll_interval_ms: 100,
            launcher: PathBuf::from("spawn-fcgi"),
            interpreter: PathBuf::from("python3"),
            server_entry: PathBuf::from("server.py"),
            default_user: None,
            proxy: ProxyConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_port == 0 {
            return Err(anyhow!("base_port must be > 0"));
        }
        if self.stop_timeout_secs == 0 {
            return Err(anyhow!("stop_timeout_secs must be > 0"));
        }
        if self.stop_poll_interval_ms == 0 {
            return Err(anyhow!("stop_poll_interval_ms must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.launcher.as_os_str().is_empty() {
            return Err(anyhow!("launcher must be non-empty"));
        }
        if self.server_entry.as_os_str().is_empty() {
            return Err(anyhow!("server_entry must be non-empty"));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.poll_interval_ms))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SupervisorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fcgivisor.toml");
        let cfg = SupervisorConfig {
            default_user: Some("www-data".to_string()),
            proxy: ProxyConfig {
                output_dir: Some(temp.path().join("nginx")),
                template: None,
            },
            ..SupervisorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("fcgivisor.toml");
        fs::write(&path, "base_port = 7000\n[proxy]\noutput_dir = \"/etc/nginx/apps\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.base_port, 7000);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.proxy.output_dir, Some(PathBuf::from("/etc/nginx/apps")));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let cfg = SupervisorConfig {
            poll_interval_ms: 0,
            ..SupervisorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
