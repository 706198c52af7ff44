//! Local supervisor for FastCGI application servers.
//!
//! A single-threaded, readiness-driven runtime launches registered workers,
//! restarts them when they crash, stops them on request, and serves a
//! line-oriented control protocol over a Unix socket. The crate is split the
//! same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (port allocation, protocol
//!   framing, restart decisions, status rendering). No I/O.
//! - **[`io`]**: Side-effecting helpers (config, registry store, child
//!   processes, proxy location files, pidfile).
//!
//! Orchestration modules ([`reactor`], [`reaper`], [`app`], [`supervisor`],
//! [`server`]) tie the two together on one event loop.

pub mod app;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod reactor;
pub mod reaper;
pub mod server;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
