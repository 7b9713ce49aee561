//! Error types for zfsrecomp
//!
//! This module defines all error types used throughout the application,
//! providing detailed error information for diagnostics and exit codes.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for zfsrecomp operations
#[derive(Error, Debug)]
pub enum ZfsRecompError {
    /// I/O error during file operations
    #[error("I/O error at '{}': {}", .path.display(), .source)]
    Io {
        /// Path the operation was working on
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A child command could not be started
    #[error("`{command}` failed to start: {source}")]
    CommandStart {
        /// The shell command line
        command: String,
        /// Spawn error
        #[source]
        source: std::io::Error,
    },

    /// A child command started but exited with a failure
    #[error("`{command}` exited with {exit}: {output}")]
    CommandFailed {
        /// The shell command line
        command: String,
        /// Exit status of the child
        exit: i32,
        /// Captured stdout/stderr, if any
        output: String,
    },

    /// Post-rewrite verification found the on-disk contents differ
    /// from the buffered original
    #[error("rewrite check failed for '{}'", .0.display())]
    VerifyFailed(PathBuf),

    /// Invalid configuration or command-line usage
    #[error("configuration error: {0}")]
    Config(String),
}

impl ZfsRecompError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// The OS error number behind this error, when there is one.
    ///
    /// The process exit code is the errno of the first worker failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            Self::CommandStart { source, .. } => source.raw_os_error(),
            Self::VerifyFailed(_) => Some(libc::EIO),
            Self::Config(_) => Some(libc::EINVAL),
            Self::CommandFailed { .. } => None,
        }
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } | Self::VerifyFailed(path) => Some(path),
            _ => None,
        }
    }
}

/// Result type alias for zfsrecomp operations
pub type Result<T> = std::result::Result<T, ZfsRecompError>;

impl From<std::io::Error> for ZfsRecompError {
    fn from(err: std::io::Error) -> Self {
        ZfsRecompError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| ZfsRecompError::io(path, e))
    }
}
