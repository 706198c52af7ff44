//! Stable exit codes for fcgivisor CLI commands.

/// Command succeeded (or the supervisor shut down cleanly).
pub const OK: i32 = 0;
/// Invalid config, arguments, or another local failure.
pub const INVALID: i32 = 1;
/// `fcgivisor ctl` received an `ERROR` reply.
pub const COMMAND_FAILED: i32 = 2;
/// `fcgivisor ctl` could not reach the control socket.
pub const UNREACHABLE: i32 = 3;
