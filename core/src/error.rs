use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path {}: {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive format error: {0}")]
    Format(String),

    #[error(
        "Too many files changed ({ratio:.2}% > {tolerance:.2}% tolerance), aborting for precaution: {}",
        .sample.join(", ")
    )]
    ChangeThresholdExceeded {
        ratio: f64,
        tolerance: f64,
        sample: Vec<String>,
    },

    #[error("Cipher failure: {0}")]
    Cipher(String),

    #[error("Transient remote error during {operation}: {message}")]
    RemoteTransient { operation: String, message: String },

    #[error("Remote failure during {operation}: {message}")]
    RemoteFailure { operation: String, message: String },

    #[error("Checksum mismatch: local {local}, remote {remote}")]
    ChecksumMismatch { local: String, remote: String },

    #[error("Remote job {job_id} failed: {message}")]
    RemoteJobFailed { job_id: String, message: String },

    #[error("Remote job {job_id} has not completed yet")]
    JobNotComplete { job_id: String },

    #[error("Not found: {id}")]
    NotFound { id: String },

    #[error("Local store corrupted: {0}")]
    StoreCorrupt(String),

    #[error("Local store {path} is locked by another process")]
    StoreLocked { path: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers that log or report failures
/// without caring about the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Serialization,
    ArchiveFormat,
    ChangeThresholdExceeded,
    CipherFailure,
    RemoteTransient,
    RemoteFailure,
    ChecksumMismatch,
    RemoteJobFailed,
    JobNotComplete,
    NotFound,
    StoreCorrupt,
    StoreLocked,
    Cancelled,
    Config,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Path { .. } => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Format(_) => ErrorKind::ArchiveFormat,
            Error::ChangeThresholdExceeded { .. } => ErrorKind::ChangeThresholdExceeded,
            Error::Cipher(_) => ErrorKind::CipherFailure,
            Error::RemoteTransient { .. } => ErrorKind::RemoteTransient,
            Error::RemoteFailure { .. } => ErrorKind::RemoteFailure,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::RemoteJobFailed { .. } => ErrorKind::RemoteJobFailed,
            Error::JobNotComplete { .. } => ErrorKind::JobNotComplete,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::StoreCorrupt(_) => ErrorKind::StoreCorrupt,
            Error::StoreLocked { .. } => ErrorKind::StoreLocked,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config(_) => ErrorKind::Config,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Path {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Error::NotFound { id: id.into() }
    }

    /// Turns an exhausted transient error into its terminal form. Other
    /// variants pass through untouched.
    pub fn into_remote_failure(self, attempts: u32) -> Self {
        match self {
            Error::RemoteTransient { operation, message } => Error::RemoteFailure {
                operation,
                message: format!("{} (gave up after {} attempts)", message, attempts),
            },
            other => other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::ArchiveFormat => "archive-format",
            ErrorKind::ChangeThresholdExceeded => "change-threshold-exceeded",
            ErrorKind::CipherFailure => "cipher-failure",
            ErrorKind::RemoteTransient => "remote-transient",
            ErrorKind::RemoteFailure => "remote-failure",
            ErrorKind::ChecksumMismatch => "checksum-mismatch",
            ErrorKind::RemoteJobFailed => "remote-job-failed",
            ErrorKind::JobNotComplete => "job-not-complete",
            ErrorKind::NotFound => "not-found",
            ErrorKind::StoreCorrupt => "store-corrupt",
            ErrorKind::StoreLocked => "store-locked",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_transient_becomes_failure() {
        let err = Error::RemoteTransient {
            operation: "upload".to_string(),
            message: "503 Service Unavailable".to_string(),
        };

        let err = err.into_remote_failure(5);
        assert_eq!(err.kind(), ErrorKind::RemoteFailure);
        assert!(err.to_string().contains("gave up after 5 attempts"));

        let err = Error::Cancelled.into_remote_failure(5);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_threshold_message_lists_sample() {
        let err = Error::ChangeThresholdExceeded {
            ratio: 11.0,
            tolerance: 10.0,
            sample: vec!["/data/a".to_string(), "/data/b".to_string()],
        };

        let message = err.to_string();
        assert!(message.contains("11.00%"));
        assert!(message.contains("/data/a, /data/b"));
    }
}
