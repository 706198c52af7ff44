//! App identifiers accepted by control commands.

use std::path::{Path, PathBuf};

/// How a command names the app it operates on.
///
/// - `name:<n>` matches the registered name exactly.
/// - `path:<p>` matches the app whose directory is `<p>` or contains `<p>`.
/// - Anything else is tried as a name first, then as a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppId {
    Name(String),
    Path(PathBuf),
    Any(String),
}

impl AppId {
    pub fn parse(raw: &str) -> Self {
        if let Some(name) = raw.strip_prefix("name:") {
            Self::Name(name.to_string())
        } else if let Some(path) = raw.strip_prefix("path:") {
            Self::Path(PathBuf::from(path))
        } else {
            Self::Any(raw.to_string())
        }
    }

    /// Does this identifier select an app called `name` installed at `app_path`?
    pub fn matches(&self, name: &str, app_path: &Path) -> bool {
        match self {
            Self::Name(wanted) => wanted == name,
            Self::Path(wanted) => path_within(wanted, app_path),
            Self::Any(raw) => raw == name,
        }
    }

    /// Path fallback for [`AppId::Any`] once no name matched.
    pub fn fallback_path(&self) -> Option<&Path> {
        match self {
            Self::Any(raw) if !raw.is_empty() => Some(Path::new(raw)),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name:{name}"),
            Self::Path(path) => write!(f, "path:{}", path.display()),
            Self::Any(raw) => f.write_str(raw),
        }
    }
}

/// `candidate` is the app directory itself or something inside it.
///
/// Comparison is component-wise, so `/apps/foo` does not own `/apps/foobar`
/// and trailing slashes are irrelevant.
pub fn path_within(candidate: &Path, app_path: &Path) -> bool {
    !app_path.as_os_str().is_empty() && candidate.starts_with(app_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixes() {
        assert_eq!(AppId::parse("name:foo"), AppId::Name("foo".into()));
        assert_eq!(
            AppId::parse("path:/apps/foo"),
            AppId::Path(PathBuf::from("/apps/foo"))
        );
        assert_eq!(AppId::parse("foo"), AppId::Any("foo".into()));
    }

    #[test]
    fn path_matches_app_dir_and_children() {
        let id = AppId::parse("path:/apps/foo/static/");
        assert!(id.matches("foo", Path::new("/apps/foo")));
        assert!(AppId::parse("path:/apps/foo/").matches("foo", Path::new("/apps/foo")));
    }

    #[test]
    fn path_does_not_match_sibling_prefix() {
        let id = AppId::parse("path:/apps/foobar");
        assert!(!id.matches("foo", Path::new("/apps/foo")));
    }

    #[test]
    fn bare_id_matches_name_only() {
        let id = AppId::parse("foo");
        assert!(id.matches("foo", Path::new("/apps/bar")));
        assert!(!id.matches("bar", Path::new("/apps/foo")));
        assert_eq!(id.fallback_path(), Some(Path::new("foo")));
    }
}
