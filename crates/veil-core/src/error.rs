use thiserror::Error;

pub type VeilResult<T> = Result<T, VeilError>;

/// Error taxonomy of the vault core.
///
/// Internal layers fail with `VeilError` and `?`; the public boundary maps
/// every error to a POSIX errno via [`VeilError::errno`] (callers negate).
#[derive(Debug, Error)]
pub enum VeilError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file not opened for writing")]
    NotWritable,

    #[error("block authentication failure, refusing to read")]
    MacMismatch,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("operation not supported by host adapter")]
    NotSupported,

    #[error("not found")]
    NotFound,

    #[error("is a directory")]
    IsDirectory,

    #[error("name coding failed: {0}")]
    NameCoding(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VeilError {
    /// POSIX errno for this error (positive constant; negate at the entry
    /// boundary). An `Io` variant carrying a raw OS error reports that
    /// code, anything else collapses to `EIO`.
    pub fn errno(&self) -> i32 {
        match self {
            VeilError::InvalidArgument(_) => libc::EINVAL,
            VeilError::NotWritable => libc::EBADF,
            VeilError::MacMismatch => libc::EIO,
            VeilError::PermissionDenied(_) => libc::EACCES,
            VeilError::NotPermitted(_) => libc::EPERM,
            VeilError::Busy(_) => libc::EBUSY,
            VeilError::NotSupported => libc::ENOSYS,
            VeilError::NotFound => libc::ENOENT,
            VeilError::IsDirectory => libc::EISDIR,
            VeilError::NameCoding(_) => libc::EACCES,
            VeilError::Config(_) => libc::EINVAL,
            VeilError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            VeilError::Other(_) => libc::EIO,
        }
    }

    /// Convenience for building the `Io` variant from an errno code.
    pub fn from_errno(code: i32) -> Self {
        VeilError::Io(std::io::Error::from_raw_os_error(code))
    }
}

impl From<&VeilError> for i32 {
    fn from(err: &VeilError) -> i32 {
        -err.errno()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VeilError::InvalidArgument("x".into()).errno(), libc::EINVAL);
        assert_eq!(VeilError::NotWritable.errno(), libc::EBADF);
        assert_eq!(VeilError::MacMismatch.errno(), libc::EIO);
        assert_eq!(VeilError::Busy("open".into()).errno(), libc::EBUSY);
        assert_eq!(VeilError::NotSupported.errno(), libc::ENOSYS);
        assert_eq!(VeilError::NotFound.errno(), libc::ENOENT);
    }

    #[test]
    fn io_errors_keep_their_raw_code() {
        let err = VeilError::from_errno(libc::ENOSPC);
        assert_eq!(err.errno(), libc::ENOSPC);

        let generic = VeilError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "synthetic",
        ));
        assert_eq!(generic.errno(), libc::EIO);
    }

    #[test]
    fn boundary_negation() {
        let err = VeilError::NotFound;
        assert_eq!(i32::from(&err), -libc::ENOENT);
    }
}
