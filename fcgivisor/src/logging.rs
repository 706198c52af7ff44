//! Tracing setup shared by the daemon and the control client.
//!
//! Everything the supervisor reports, including drained child output, goes
//! through `tracing` to stderr. Log rotation is left to whatever captures
//! stderr (systemd, a container runtime, `svlogd`).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` if unset
/// (`info` for `serve`, `warn` for client commands).
///
/// # Example
/// ```bash
/// RUST_LOG=fcgivisor=debug fcgivisor serve --config /etc/fcgivisor.toml
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
