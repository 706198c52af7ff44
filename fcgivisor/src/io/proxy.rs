//! Reverse-proxy location files for registered apps.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{debug, info};

use crate::io::config::{ProxyConfig, write_atomic};
use crate::io::process::BIND_ADDRESS;

const LOCATION_TEMPLATE: &str = include_str!("../templates/location.conf.j2");

/// Template context for one app.
#[derive(Debug, Clone)]
pub struct ProxyLocation<'a> {
    pub name: &'a str,
    pub path: &'a Path,
    pub port: u16,
}

/// Renders and places `<name>.conf` files for the reverse proxy.
pub struct ProxyWriter {
    env: Environment<'static>,
    template: String,
    output_dir: Option<PathBuf>,
}

impl ProxyWriter {
    /// Load the configured template (or the built-in one).
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let template = match &config.template {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("read proxy template {}", path.display()))?,
            None => LOCATION_TEMPLATE.to_string(),
        };
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        let writer = Self {
            env,
            template,
            output_dir: config.output_dir.clone(),
        };
        writer
            .env
            .template_from_str(&writer.template)
            .context("compile proxy template")?;
        Ok(writer)
    }

    pub fn render(&self, location: &ProxyLocation<'_>) -> Result<String> {
        let rendered = self.env.render_str(
            &self.template,
            context! {
                name => location.name,
                path => location.path.display().to_string(),
                port => location.port,
                host => BIND_ADDRESS,
            },
        )?;
        Ok(rendered)
    }

    /// File that `name` renders to, if generation is enabled.
    pub fn location_path(&self, name: &str) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(format!("{name}.conf")))
    }

    /// Render and write the location file; `Ok(None)` when generation is disabled.
    ///
    /// The underlying `io::Error` stays in the error chain so callers can
    /// tell permission problems apart.
    pub fn write(&self, location: &ProxyLocation<'_>) -> Result<Option<PathBuf>> {
        let Some(target) = self.location_path(location.name) else {
            debug!(app = location.name, "proxy generation disabled");
            return Ok(None);
        };
        let rendered = self.render(location)?;
        write_atomic(&target, &rendered)?;
        info!(app = location.name, path = %target.display(), "proxy location written");
        Ok(Some(target))
    }

    /// Remove the location file for `name`; a missing file is fine.
    pub fn remove(&self, name: &str) -> io::Result<()> {
        let Some(target) = self.location_path(name) else {
            return Ok(());
        };
        match fs::remove_file(&target) {
            Ok(()) => {
                info!(app = name, path = %target.display(), "proxy location removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location<'a>(path: &'a Path) -> ProxyLocation<'a> {
        ProxyLocation {
            name: "foo",
            path,
            port: 9502,
        }
    }

    #[test]
    fn builtin_template_points_at_worker_port() {
        let writer = ProxyWriter::new(&ProxyConfig::default()).expect("writer");
        let rendered = writer.render(&location(Path::new("/apps/foo"))).expect("render");
        assert!(rendered.contains("location /foo/ {"));
        assert!(rendered.contains("fastcgi_pass 127.0.0.1:9502;"));
        assert!(rendered.contains("alias /apps/foo/static/;"));
    }

    #[test]
    fn disabled_generation_writes_nothing() {
        let writer = ProxyWriter::new(&ProxyConfig::default()).expect("writer");
        let written = writer.write(&location(Path::new("/apps/foo"))).expect("write");
        assert_eq!(written, None);
        writer.remove("foo").expect("remove");
    }

    #[test]
    fn custom_template_write_and_remove() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template = temp.path().join("location.j2");
        fs::write(&template, "{{ name }} -> {{ host }}:{{ port }}\n").expect("template");
        let writer = ProxyWriter::new(&ProxyConfig {
            output_dir: Some(temp.path().join("nginx")),
            template: Some(template),
        })
        .expect("writer");

        let written = writer
            .write(&location(Path::new("/apps/foo")))
            .expect("write")
            .expect("path");
        assert_eq!(written, temp.path().join("nginx/foo.conf"));
        assert_eq!(
            fs::read_to_string(&written).expect("read"),
            "foo -> 127.0.0.1:9502\n"
        );

        writer.remove("foo").expect("remove");
        assert!(!written.exists());
        writer.remove("foo").expect("remove again");
    }

    #[test]
    fn broken_template_is_rejected_up_front() {
        let temp = tempfile::tempdir().expect("tempdir");
        let template = temp.path().join("broken.j2");
        fs::write(&template, "{% if %}").expect("template");
        let result = ProxyWriter::new(&ProxyConfig {
            output_dir: None,
            template: Some(template),
        });
        assert!(result.is_err());
    }
}
