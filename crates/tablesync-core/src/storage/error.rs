//! Storage error types and their classification from backend failures.
use std::{error::Error, fmt, io};

use snafu::{Backtrace, prelude::*};

/// Errors produced by a storage backend implementation.
///
/// Backend-specific I/O errors are wrapped in this enum so higher layers can
/// map them into [`StorageError`] variants with additional context.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
    /// A failure reported by the in-memory backend.
    Memory(io::Error),
}

impl BackendError {
    /// The I/O error kind reported by the backend.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            BackendError::Local(e) | BackendError::Memory(e) => e.kind(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
            BackendError::Memory(e) => write!(f, "in-memory storage error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) | BackendError::Memory(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Any other backend failure.
    #[snafu(display("I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A location string could not be interpreted.
    #[snafu(display("Invalid storage location {spec:?}: {reason}"))]
    InvalidLocation {
        /// The location string supplied by the caller.
        spec: String,
        /// Why the location was rejected.
        reason: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Build the error variant matching the backend error's kind.
    pub(crate) fn classify(path: impl Into<String>, source: BackendError) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound {
                path,
                source,
                backtrace: Backtrace::capture(),
            },
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
                path,
                source,
                backtrace: Backtrace::capture(),
            },
            _ => StorageError::OtherIo {
                path,
                source,
                backtrace: Backtrace::capture(),
            },
        }
    }

    /// True when the error reports a missing path.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
