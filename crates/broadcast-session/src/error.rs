//! Error types for the session controller.

use std::path::PathBuf;

use broadcast_muxer::MuxerError;
use broadcast_writer::WriterError;
use thiserror::Error;

/// Errors that can end or prevent a recording session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No application-group identifier is configured.
    #[error("App group identifier is not configured")]
    MissingAppGroup,

    /// The configuration file could not be used.
    #[error("Failed to load configuration from {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },

    /// A session is already recording.
    #[error("A session is already active")]
    AlreadyActive,

    /// Multiplexer failure.
    #[error(transparent)]
    Muxer(#[from] MuxerError),

    /// Container writer could not be created.
    #[error(transparent)]
    Writer(#[from] WriterError),

    /// Shared output record could not be read or written.
    #[error("Shared record error: {0}")]
    Record(String),

    /// Stop notification could not be registered or posted.
    #[error("Notification error: {0}")]
    Notification(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
