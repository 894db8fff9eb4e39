use adbfs_adb::AdbError;
use thiserror::Error;

/// Everything an operation can fail with, classified where the failure
/// originates. The dispatcher's last step maps each kind to an errno.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {path}")]
    NoEntry { path: String },

    /// The user lacks permission. Linux distinguishes this (EACCES) from
    /// an operation the filesystem itself forbids (EPERM).
    #[error("permission denied: {path}")]
    NoPermission { path: String },

    /// Forbidden by filesystem policy: read-only mount, unsupported flag
    /// combination, wrong handle mode.
    #[error("operation not permitted: {reason}")]
    NotPermitted { reason: String },

    #[error("not a symlink: {path}")]
    NotALink { path: String },

    #[error("too many levels of symbolic links resolving {path}")]
    LinkTooDeep { path: String },

    #[error("operation not implemented: {op}")]
    NotImplemented { op: &'static str },

    /// The device disappeared from the adb server. The operation fails
    /// with EIO; the mount is torn down asynchronously.
    #[error("device disconnected")]
    DeviceNotFound,

    /// A mutating shell command printed output; the text is the device's
    /// error report and the errno was chosen by the call site.
    #[error("{command}: {output}")]
    CommandFailed {
        command: String,
        output: String,
        errno: i32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Adb(AdbError),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FsError::NoEntry { .. } => ENOENT,
            FsError::NoPermission { .. } => EACCES,
            FsError::NotPermitted { .. } => EPERM,
            FsError::NotALink { .. } => EINVAL,
            FsError::LinkTooDeep { .. } => ELOOP,
            FsError::NotImplemented { .. } => ENOSYS,
            FsError::DeviceNotFound => EIO,
            FsError::CommandFailed { errno, .. } => *errno,
            FsError::Io(_) => EIO,
            FsError::Adb(_) => EIO,
        }
    }

    /// Whether finishing an operation with this error should emit an error
    /// record. EIO-class failures are unexpected and logged; everything
    /// else is an ordinary POSIX failure path (stat of a missing file, a
    /// permission check) and only shows up in the per-operation status.
    pub fn logs_as_error(&self) -> bool {
        matches!(
            self,
            FsError::DeviceNotFound | FsError::Io(_) | FsError::Adb(_)
        )
    }
}

impl From<AdbError> for FsError {
    fn from(err: AdbError) -> Self {
        match err {
            AdbError::DeviceNotFound { .. } => FsError::DeviceNotFound,
            AdbError::FileNoExist { path } => FsError::NoEntry { path },
            other => FsError::Adb(other),
        }
    }
}
