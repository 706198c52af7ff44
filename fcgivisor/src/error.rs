//! Errors reported back to control clients.
//!
//! Every failure a command can produce maps onto an errno so the reply line
//! reads `ERROR <errno> <message>`. Internal plumbing (config, store
//! serialization) keeps using `anyhow` and is folded into [`SupervisorError::Internal`].

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Bad or missing command arguments, or an unknown app identifier.
    #[error("{0}")]
    InvalidArgument(String),

    /// Missing launcher binary or other missing resource.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate registration.
    #[error("{0}")]
    AlreadyExists(String),

    /// Generated configuration could not be written.
    #[error("{0}")]
    PermissionDenied(String),

    #[error("Unknown command \"{0}\"")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

impl SupervisorError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::InvalidArgument(_) => Errno::EINVAL,
            Self::NotFound(_) => Errno::ENOENT,
            Self::AlreadyExists(_) => Errno::EEXIST,
            Self::PermissionDenied(_) => Errno::EACCES,
            Self::Unsupported(_) => Errno::EOPNOTSUPP,
            Self::Io(err) => err.raw_os_error().map_or(Errno::EIO, Errno::from_raw),
            Self::Internal(_) => Errno::EIO,
        }
    }

    /// Numeric errno sent on the wire.
    pub fn code(&self) -> i32 {
        self.errno() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_errno_values() {
        assert_eq!(
            SupervisorError::Unsupported("x".into()).code(),
            Errno::EOPNOTSUPP as i32
        );
        assert_eq!(
            SupervisorError::AlreadyExists("x".into()).code(),
            Errno::EEXIST as i32
        );
        assert_eq!(
            SupervisorError::InvalidArgument("x".into()).code(),
            Errno::EINVAL as i32
        );
    }

    #[test]
    fn io_errors_keep_their_os_code() {
        let err = SupervisorError::from(std::io::Error::from_raw_os_error(Errno::EACCES as i32));
        assert_eq!(err.errno(), Errno::EACCES);

        let err = SupervisorError::from(std::io::Error::other("no os code"));
        assert_eq!(err.errno(), Errno::EIO);
    }

    #[test]
    fn unsupported_message_quotes_command() {
        let err = SupervisorError::Unsupported("frobnicate".into());
        assert_eq!(err.to_string(), "Unknown command \"frobnicate\"");
    }
}
