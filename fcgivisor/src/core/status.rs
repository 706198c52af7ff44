//! App status summaries as shown by `list`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Running { pid: u32, port: u16 },
    Disabled,
    Stopped,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { pid, port } => write!(f, "pid {pid}, running on port {port}"),
            Self::Disabled => f.write_str("disabled"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Render `name (status), name (status), ...`; empty input renders as `""`.
pub fn render_list<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, AppStatus)>,
{
    entries
        .into_iter()
        .map(|(name, status)| format!("{name} ({status})"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_is_empty_string() {
        assert_eq!(render_list([]), "");
    }

    #[test]
    fn renders_each_status() {
        let rendered = render_list([
            ("api", AppStatus::Running { pid: 42, port: 9500 }),
            ("blog", AppStatus::Disabled),
            ("wiki", AppStatus::Stopped),
        ]);
        assert_eq!(
            rendered,
            "api (pid 42, running on port 9500), blog (disabled), wiki (stopped)"
        );
    }
}
