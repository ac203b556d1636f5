use thiserror::Error;

/// Module update error types
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Package or directory path is not acceptable
    #[error("Invalid path: {0}")]
    PathInvalid(String),

    /// Malformed zip, JSON metadata or signature footer
    #[error("Format error: {0}")]
    Format(String),

    /// Candidate generation is not newer than the one it must replace
    #[error("Version too low: {candidate} is not newer than {floor}")]
    VersionTooLow { candidate: String, floor: String },

    /// Signature or hash-tree verification failed
    #[error("Verification failed: {0}")]
    VerifyFailed(String),

    /// No loop device, mount point busy, device node never appeared
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backup of the active generation could not be created
    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// Parameter store write failed
    #[error("Config write failed: {name} = {value}")]
    ConfigWriteFailed { name: String, value: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Unknown hmp, module id or device
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl UpdateError {
    /// Numeric code recorded in the result log for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            UpdateError::PathInvalid(_) => ErrorCode::PathInvalid,
            UpdateError::Format(_) | UpdateError::Serialization(_) => ErrorCode::FormatError,
            UpdateError::VersionTooLow { .. } => ErrorCode::VersionTooLow,
            UpdateError::VerifyFailed(_) => ErrorCode::VerifySignFail,
            UpdateError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            UpdateError::Io(_) => ErrorCode::IoFailure,
            UpdateError::BackupFailed(_) => ErrorCode::BackupFailed,
            UpdateError::ConfigWriteFailed { .. } => ErrorCode::ConfigWriteFailed,
            UpdateError::NotFound(_) => ErrorCode::NotFound,
            UpdateError::Config(_) | UpdateError::Other(_) => ErrorCode::InternalError,
        }
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(err: serde_json::Error) -> Self {
        UpdateError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for UpdateError {
    fn from(err: serde_yaml::Error) -> Self {
        UpdateError::Serialization(err.to_string())
    }
}

/// Result type alias for module update operations
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Numeric result codes surfaced through the result log and the service API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    PathInvalid = 1,
    FormatError = 2,
    VersionTooLow = 3,
    VerifySignFail = 4,
    ResourceExhausted = 5,
    IoFailure = 6,
    BackupFailed = 7,
    ConfigWriteFailed = 8,
    NotFound = 9,
    RevertSuccess = 10,
    RevertFailed = 11,
    InternalError = 12,
}

impl ErrorCode {
    /// Short human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::PathInvalid => "invalid path",
            ErrorCode::FormatError => "malformed package",
            ErrorCode::VersionTooLow => "version too low",
            ErrorCode::VerifySignFail => "verify sign fail",
            ErrorCode::ResourceExhausted => "resource exhausted",
            ErrorCode::IoFailure => "io failure",
            ErrorCode::BackupFailed => "backup failed",
            ErrorCode::ConfigWriteFailed => "config write failed",
            ErrorCode::NotFound => "not found",
            ErrorCode::RevertSuccess => "revert success",
            ErrorCode::RevertFailed => "revert failed",
            ErrorCode::InternalError => "internal error",
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a raw code back; unknown values become `InternalError`.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => ErrorCode::Success,
            1 => ErrorCode::PathInvalid,
            2 => ErrorCode::FormatError,
            3 => ErrorCode::VersionTooLow,
            4 => ErrorCode::VerifySignFail,
            5 => ErrorCode::ResourceExhausted,
            6 => ErrorCode::IoFailure,
            7 => ErrorCode::BackupFailed,
            8 => ErrorCode::ConfigWriteFailed,
            9 => ErrorCode::NotFound,
            10 => ErrorCode::RevertSuccess,
            11 => ErrorCode::RevertFailed,
            _ => ErrorCode::InternalError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_too_low_display() {
        let error = UpdateError::VersionTooLow {
            candidate: "1.2.0".to_string(),
            floor: "1.3.0".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Version too low: 1.2.0 is not newer than 1.3.0"
        );
    }

    #[test]
    fn test_config_write_failed_display() {
        let error = UpdateError::ConfigWriteFailed {
            name: "hmp.sa.42.status".to_string(),
            value: "".to_string(),
        };
        assert_eq!(error.to_string(), "Config write failed: hmp.sa.42.status = ");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: UpdateError = io_error.into();
        assert!(matches!(err, UpdateError::Io(_)));
        assert_eq!(err.code(), ErrorCode::IoFailure);
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ bad");
        let err: UpdateError = result.unwrap_err().into();
        assert!(matches!(err, UpdateError::Serialization(_)));
        assert_eq!(err.code(), ErrorCode::FormatError);
    }

    #[test]
    fn test_error_codes_map_taxonomy() {
        assert_eq!(
            UpdateError::VerifyFailed("x".into()).code(),
            ErrorCode::VerifySignFail
        );
        assert_eq!(
            UpdateError::BackupFailed("x".into()).code(),
            ErrorCode::BackupFailed
        );
        assert_eq!(
            UpdateError::ResourceExhausted("x".into()).code(),
            ErrorCode::ResourceExhausted
        );
        assert_eq!(UpdateError::PathInvalid("x".into()).code(), ErrorCode::PathInvalid);
    }

    #[test]
    fn test_error_code_round_trip_and_unknown() {
        for code in [ErrorCode::Success, ErrorCode::RevertFailed, ErrorCode::NotFound] {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), code);
        }
        assert_eq!(ErrorCode::from_i32(999), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::VerifySignFail.to_string(), "verify sign fail (4)");
    }
}
