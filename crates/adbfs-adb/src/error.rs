use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("adb server rejected request {request}: {message}")]
    RequestFailed { request: String, message: String },

    #[error("device not found: {serial}")]
    DeviceNotFound { serial: String },

    #[error("no such file or directory: {path}")]
    FileNoExist { path: String },

    #[error("sync transfer failed: {message}")]
    TransferFailed { message: String },

    #[error("protocol violation: {detail}")]
    Protocol { detail: String },
}

pub type Result<T> = std::result::Result<T, AdbError>;

impl AdbError {
    /// True when the error means the device has disappeared from the adb
    /// server (unplugged, adb restarted, switched to recovery).
    pub fn is_device_not_found(&self) -> bool {
        matches!(self, AdbError::DeviceNotFound { .. })
    }

    /// True when the error means the remote path does not exist.
    pub fn is_file_no_exist(&self) -> bool {
        matches!(self, AdbError::FileNoExist { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_not_found_is_classified() {
        let err = AdbError::DeviceNotFound {
            serial: "emulator-5554".to_string(),
        };
        assert!(err.is_device_not_found());
        assert!(!err.is_file_no_exist());
    }

    #[test]
    fn file_no_exist_is_classified() {
        let err = AdbError::FileNoExist {
            path: "/sdcard/missing".to_string(),
        };
        assert!(err.is_file_no_exist());
        assert!(!err.is_device_not_found());
    }

    #[test]
    fn io_error_is_neither() {
        let err = AdbError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(!err.is_device_not_found());
        assert!(!err.is_file_no_exist());
    }

    #[test]
    fn display_messages_non_empty() {
        let errors = [
            AdbError::RequestFailed {
                request: "host:version".to_string(),
                message: "bad".to_string(),
            },
            AdbError::DeviceNotFound {
                serial: "x".to_string(),
            },
            AdbError::FileNoExist {
                path: "/x".to_string(),
            },
            AdbError::TransferFailed {
                message: "short write".to_string(),
            },
            AdbError::Protocol {
                detail: "bad id".to_string(),
            },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
