//! The error taxonomy shared across the crate.

use nix::errno::Errno;
use thiserror::Error;

/// Errors configuring attributes, launching a child, or reaping one.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed argument or flag combination.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A string that cannot be represented in the form the native launch
    /// call accepts. Carries the offending string.
    #[error("Cannot encode for the native launcher: {0:?}")]
    Encoding(String),

    /// A path that cannot be converted to the native form.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The feature is absent on this host entirely.
    #[error("Not supported on this host: {0}")]
    NotSupported(&'static str),

    /// Credential validation or impersonation was refused.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// An opaque native failure from a spawn, wait, or group call.
    #[error("OS error: {0}")]
    Os(#[from] Errno),

    /// The attributes already hold a credential; it is left intact.
    #[error("Credential already set")]
    AlreadySet,

    /// The process was already reaped by a previous wait.
    #[error("Process already waited for")]
    AlreadyWaited,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The native code handed to diagnostic callbacks for this error.
    pub(crate) fn code(&self) -> i32 {
        match self {
            Self::Os(errno) => *errno as i32,
            Self::PermissionDenied(_) => Errno::EPERM as i32,
            Self::NotSupported(_) => Errno::ENOSYS as i32,
            _ => Errno::EINVAL as i32,
        }
    }
}
