//! Error types for blockget core

use blockget_types::ErrorCode;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in blockget core
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Mission not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Server did not report a content length")]
    UnsupportedServer,

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Body ended early: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Location is not a directory: {}", .0.display())]
    InvalidLocation(PathBuf),

    #[error("Too many existing files for {name} ({attempts} names tried)")]
    TooManyCollisions { name: String, attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported ledger version {0}")]
    LedgerVersion(u32),

    #[error("Mission was cancelled")]
    Cancelled,

    #[error("Mission was paused")]
    Paused,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Wrap an I/O error raised while touching `path`, keeping permission
    /// failures distinct from generic I/O failures.
    pub fn io_at(err: io::Error, path: &Path) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            EngineError::PermissionDenied(path.to_path_buf())
        } else {
            EngineError::Io(err)
        }
    }

    /// The code stored on a mission that fails with this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::UnsupportedServer => ErrorCode::ServerUnsupported,
            EngineError::ServerError { status, .. } if *status == 200 || *status == 206 => {
                ErrorCode::ServerUnsupported
            }
            EngineError::ServerError { .. }
            | EngineError::Network(_)
            | EngineError::Truncated { .. } => ErrorCode::Network,
            EngineError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            EngineError::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                ErrorCode::PermissionDenied
            }
            EngineError::Io(_) | EngineError::InvalidLocation(_) => ErrorCode::Storage,
            _ => ErrorCode::Unknown,
        }
    }

    /// Pause and cancel are control flow, not failures
    pub fn is_interruption(&self) -> bool {
        matches!(self, EngineError::Paused | EngineError::Cancelled)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_keep_their_path() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let mapped = EngineError::io_at(err, Path::new("/mnt/card"));
        assert!(matches!(mapped, EngineError::PermissionDenied(ref p) if p == Path::new("/mnt/card")));
        assert_eq!(mapped.error_code(), ErrorCode::PermissionDenied);
    }

    #[test]
    fn codes_by_variant() {
        assert_eq!(
            EngineError::UnsupportedServer.error_code(),
            ErrorCode::ServerUnsupported
        );
        assert_eq!(
            EngineError::Truncated {
                expected: 10,
                received: 4
            }
            .error_code(),
            ErrorCode::Network
        );
        assert_eq!(
            EngineError::ServerError {
                status: 200,
                message: "range ignored".into()
            }
            .error_code(),
            ErrorCode::ServerUnsupported
        );
        assert_eq!(
            EngineError::Io(io::Error::new(io::ErrorKind::Other, "disk")).error_code(),
            ErrorCode::Storage
        );
        assert!(EngineError::Paused.is_interruption());
        assert!(!EngineError::UnsupportedServer.is_interruption());
    }
}
