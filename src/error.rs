use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::wire::FrameError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed data on the wire: {0}")]
    Framing(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Session is closed")]
    SessionClosed,
}

impl From<FrameError> for SyncError {
    fn from(err: FrameError) -> Self {
        if err.is_integrity() {
            SyncError::Integrity(err.to_string())
        } else {
            SyncError::Framing(err.to_string())
        }
    }
}

impl SyncError {
    /// Errors after which the connection cannot be used any more.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_)
                | SyncError::Framing(_)
                | SyncError::Integrity(_)
                | SyncError::Authentication(_)
                | SyncError::SessionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
