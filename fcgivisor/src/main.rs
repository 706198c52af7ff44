//! FastCGI process supervisor.
//!
//! `fcgivisor serve` runs the supervisor loop; `fcgivisor ctl` sends one
//! control command to a running supervisor; `fcgivisor init` writes a
//! default config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{info, warn};

use fcgivisor::exit_codes;
use fcgivisor::io::config::{DEFAULT_CONFIG_PATH, SupervisorConfig, load_config, write_config};
use fcgivisor::io::pidfile::{remove_pidfile, running_pid, write_pidfile};
use fcgivisor::io::store::RegistryStore;
use fcgivisor::logging;
use fcgivisor::reactor::Reactor;
use fcgivisor::reaper::ChildReaper;
use fcgivisor::server::{ControlListener, request};
use fcgivisor::supervisor::Supervisor;

/// Slack on top of the worst-case two-phase stop before `ctl` gives up.
const CTL_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "fcgivisor", version, about = "Supervise FastCGI app servers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor in the foreground.
    Serve {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Send one command (e.g. `list`, `start foo`) to a running supervisor.
    Ctl {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Control socket; overrides the config file.
        #[arg(short, long)]
        socket: Option<PathBuf>,
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },
    /// Write a default config file.
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Serve { config } => {
            logging::init("info");
            report(cmd_serve(&config))
        }
        Command::Ctl {
            config,
            socket,
            words,
        } => {
            logging::init("warn");
            cmd_ctl(&config, socket.as_deref(), &words)
        }
        Command::Init { config, force } => {
            logging::init("warn");
            report(cmd_init(&config, force))
        }
    };
    std::process::exit(code);
}

fn report(result: Result<()>) -> i32 {
    match result {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    }
}

fn cmd_serve(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;

    if let Some(pidfile) = &config.pidfile {
        if let Some(pid) = running_pid(pidfile) {
            bail!("supervisor already running with pid {pid} ({})", pidfile.display());
        }
        write_pidfile(pidfile)?;
    }

    let result = serve(&config);

    match std::fs::remove_file(&config.socket_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %config.socket_path.display(), err = %err, "failed to remove control socket");
        }
    }
    if let Some(pidfile) = &config.pidfile {
        remove_pidfile(pidfile);
    }
    result
}

fn serve(config: &SupervisorConfig) -> Result<()> {
    let store = RegistryStore::open(&config.registry_path)?;
    let mut reactor = Reactor::new(config.poll_interval());
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, reactor.stop_flag())
            .with_context(|| format!("install handler for signal {signal}"))?;
    }

    reactor
        .handle()
        .register(ChildReaper::install().context("install SIGCHLD handler")?);

    let mut supervisor = Supervisor::load(config.clone(), store, reactor.handle())?;
    let listener = ControlListener::bind(&config.socket_path, reactor.handle())?;
    reactor.handle().register(listener);

    info!(pid = std::process::id(), "supervisor started");
    supervisor.start_all();
    let result = reactor.run(&mut supervisor);
    info!("shutting down");
    supervisor.stop_all();
    result
}

fn cmd_ctl(config_path: &Path, socket: Option<&Path>, words: &[String]) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::INVALID;
        }
    };
    let socket = socket.unwrap_or(config.socket_path.as_path());
    let timeout = config.stop_timeout() * 2 + CTL_TIMEOUT_SLACK;

    match request(socket, &words.join(" "), timeout) {
        Ok(reply) => {
            if !reply.is_empty() {
                println!("{reply}");
            }
            if reply.starts_with("ERROR") {
                exit_codes::COMMAND_FAILED
            } else {
                exit_codes::OK
            }
        }
        Err(err) => {
            eprintln!("cannot reach supervisor at {}: {err}", socket.display());
            exit_codes::UNREACHABLE
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if !force && config_path.exists() {
        bail!("{} already exists (use --force to overwrite)", config_path.display());
    }
    write_config(config_path, &SupervisorConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve_default_config() {
        let cli = Cli::parse_from(["fcgivisor", "serve"]);
        assert!(matches!(
            cli.command,
            Command::Serve { config } if config == Path::new(DEFAULT_CONFIG_PATH)
        ));
    }

    #[test]
    fn parse_ctl_keeps_words_in_order() {
        let cli = Cli::parse_from([
            "fcgivisor",
            "ctl",
            "--socket",
            "/tmp/ctl.sock",
            "register",
            "foo",
            "/apps/foo",
        ]);
        let Command::Ctl { socket, words, .. } = cli.command else {
            panic!("expected ctl");
        };
        assert_eq!(socket.as_deref(), Some(Path::new("/tmp/ctl.sock")));
        assert_eq!(words, vec!["register", "foo", "/apps/foo"]);
    }

    #[test]
    fn parse_ctl_requires_a_command() {
        assert!(Cli::try_parse_from(["fcgivisor", "ctl"]).is_err());
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["fcgivisor", "init", "--force", "-c", "/tmp/f.toml"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }
}
