//! Error types for the multiplexer.

use std::time::Duration;

use broadcast_ipc::ContainerStatus;
use broadcast_writer::WriterError;
use thiserror::Error;

/// Errors returned by [`Multiplexer`](crate::Multiplexer) operations.
#[derive(Debug, Error)]
pub enum MuxerError {
    /// Operation not allowed in the current container status.
    #[error("Operation not allowed while {}", .0.name())]
    WrongState(ContainerStatus),

    /// The container writer reported a fault.
    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),

    /// Finalization ended without a result reaching the owner.
    #[error("Multiplexer released before finalization completed")]
    OwnerReleased,

    /// Finalization did not complete in time.
    #[error("Finalization timed out after {0:?}")]
    TimedOut(Duration),

    /// The serial context is no longer running.
    #[error("Multiplexer context closed: {0}")]
    ContextClosed(String),
}

/// Result type for multiplexer operations.
pub type MuxerResult<T> = Result<T, MuxerError>;
