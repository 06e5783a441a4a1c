//! Library error types

use thiserror::Error;

/// Errors reported by the library and by backends.
///
/// Every variant maps to a stable negative integer code via [`Error::code`],
/// matching the values embedders of the C-era API expect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Input/output error
    #[error("input/output error")]
    Io,

    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,

    /// Access denied (insufficient permissions)
    #[error("access denied")]
    Access,

    /// No such device (it may have been disconnected)
    #[error("no such device")]
    NoDevice,

    /// Entity not found
    #[error("entity not found")]
    NotFound,

    /// Resource busy
    #[error("resource busy")]
    Busy,

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Overflow
    #[error("overflow")]
    Overflow,

    /// Pipe error (endpoint stalled)
    #[error("pipe error")]
    Pipe,

    /// System call interrupted (perhaps due to signal)
    #[error("system call interrupted")]
    Interrupted,

    /// Insufficient memory
    #[error("insufficient memory")]
    NoMem,

    /// Operation not supported or unimplemented by this backend
    #[error("operation not supported")]
    NotSupported,

    /// Other error
    #[error("other error: {message}")]
    Other { message: String },
}

impl Error {
    /// Stable numeric code for this error. Always negative.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io => -1,
            Error::InvalidParam => -2,
            Error::Access => -3,
            Error::NoDevice => -4,
            Error::NotFound => -5,
            Error::Busy => -6,
            Error::Timeout => -7,
            Error::Overflow => -8,
            Error::Pipe => -9,
            Error::Interrupted => -10,
            Error::NoMem => -11,
            Error::NotSupported => -12,
            Error::Other { .. } => -99,
        }
    }

    /// Build an [`Error::Other`] from anything displayable.
    pub fn other(message: impl std::fmt::Display) -> Self {
        Error::Other {
            message: message.to_string(),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::EACCES | Errno::EPERM => Error::Access,
            Errno::ENODEV | Errno::ENXIO => Error::NoDevice,
            Errno::ENOENT => Error::NotFound,
            Errno::EBUSY => Error::Busy,
            Errno::ETIMEDOUT => Error::Timeout,
            Errno::EOVERFLOW => Error::Overflow,
            Errno::EPIPE => Error::Pipe,
            Errno::EINTR => Error::Interrupted,
            Errno::ENOMEM => Error::NoMem,
            Errno::EINVAL => Error::InvalidParam,
            Errno::ENOSYS => Error::NotSupported,
            _ => Error::Io,
        }
    }
}

/// Type alias for library results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_negative_and_distinct() {
        let all = [
            Error::Io,
            Error::InvalidParam,
            Error::Access,
            Error::NoDevice,
            Error::NotFound,
            Error::Busy,
            Error::Timeout,
            Error::Overflow,
            Error::Pipe,
            Error::Interrupted,
            Error::NoMem,
            Error::NotSupported,
            Error::other("x"),
        ];
        let mut codes: Vec<i32> = all.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_errno_mapping() {
        use nix::errno::Errno;
        assert_eq!(Error::from(Errno::EACCES), Error::Access);
        assert_eq!(Error::from(Errno::ENODEV), Error::NoDevice);
        assert_eq!(Error::from(Errno::EINTR), Error::Interrupted);
        assert_eq!(Error::from(Errno::EIO), Error::Io);
    }

    #[test]
    fn test_error_display() {
        let err = Error::other("backend exploded");
        assert!(format!("{}", err).contains("backend exploded"));
        assert_eq!(format!("{}", Error::Timeout), "operation timed out");
    }
}
