//! Error types for the writer module.

use std::path::PathBuf;

use broadcast_ipc::TrackKind;
use thiserror::Error;

use crate::WriterStatus;

/// Errors that can occur while writing a container.
#[derive(Debug, Error)]
pub enum WriterError {
    /// Destination already exists.
    #[error("Output file already exists: {0}")]
    OutputExists(PathBuf),

    /// Operation not valid for the writer's status.
    #[error("Writer is {}", .0.name())]
    WrongStatus(WriterStatus),

    /// Track configuration cannot be carried.
    #[error("Unsupported {} track: {reason}", .kind.name())]
    UnsupportedTrack { kind: TrackKind, reason: String },

    /// Sample for a track that was never registered.
    #[error("Track not registered: {}", .0.name())]
    UnknownTrack(TrackKind),

    /// Container format error.
    #[error("Container error: {0}")]
    Container(String),

    /// The writer faulted earlier; carries the fault description.
    #[error("Writer failed: {0}")]
    Failed(String),

    /// The mux worker is gone.
    #[error("Mux worker unavailable")]
    WorkerUnavailable,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<mp4::Error> for WriterError {
    fn from(err: mp4::Error) -> Self {
        Self::Container(err.to_string())
    }
}
