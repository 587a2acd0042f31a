//! Error type shared by every core operation
//!
//! A merge that cannot fully auto-resolve is not an error: it is reported as
//! [`crate::MergeOutcome::Conflicted`].

use std::path::PathBuf;

use crate::object::ObjectId;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the version-control core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt object {id}: {detail}")]
    Corrupt { id: ObjectId, detail: String },

    #[error("Repository lock is held by another process: {}", .0.display())]
    LockHeld(PathBuf),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        Error::Invalid(what.into())
    }

    /// Negative process exit code for this error kind.
    ///
    /// Successful merges map to `0` and conflicted merges to `1`, so every
    /// error is strictly below zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound(_) => -1,
            Error::Invalid(_) => -2,
            Error::Exists(_) => -3,
            Error::Io(_) => -4,
            Error::Corrupt { .. } => -5,
            Error::LockHeld(_) => -6,
            Error::Serialization(_) => -7,
            Error::Cancelled => -8,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
