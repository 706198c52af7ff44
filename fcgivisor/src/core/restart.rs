//! Bounded-retry decision for unexpected worker exits.

/// What to do after a worker exited without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Launch the worker again right away.
    Restart,
    /// Give up and persist the app as disabled.
    Disable,
}

/// Decide based on the retry count *after* counting the exit that just happened.
///
/// With `max_retries = 5` the first five crashes restart; the sixth disables.
pub fn after_unexpected_exit(retry_count: u32, max_retries: u32) -> ExitAction {
    if retry_count > max_retries {
        ExitAction::Disable
    } else {
        ExitAction::Restart
    }
}
