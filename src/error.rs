//! Centralized error types for mailstash.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailstash library.
#[derive(Error, Debug)]
pub enum StashError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The reference points at a file that no longer exists.
    #[error("Stored file not found: {0}")]
    NotFound(PathBuf),

    /// The reference is structurally invalid (bad scheme, path or missing tag).
    #[error("Malformed content reference: {0}")]
    MalformedReference(String),

    /// Write or delete attempted through the read-only consumer interface.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The decoding pipe could not be set up. Try again later.
    #[error("Content temporarily unavailable: {0}")]
    Unavailable(std::io::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A MIME parsing error while staging content from a message.
    #[error("MIME error: {0}")]
    Mime(String),
}

/// Convenience alias for `Result<T, StashError>`.
pub type Result<T> = std::result::Result<T, StashError>;

impl StashError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map an open failure to `NotFound` when the file is gone, `Io` otherwise.
    pub fn open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.into())
        } else {
            Self::io(path, source)
        }
    }

    /// `true` for conditions the user can recover from by requesting the
    /// original content again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Unavailable(_))
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `StashError::io`).
impl From<std::io::Error> for StashError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
