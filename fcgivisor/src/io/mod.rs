//! I/O helpers for the supervisor.

pub mod config;
pub mod pidfile;
pub mod process;
pub mod proxy;
pub mod store;
