//! Events sent from a recording session to the host application.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::state::SessionState;

/// Events that a session can report while it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Session state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<SessionState>,

        /// Current state.
        current: Box<SessionState>,
    },

    /// An out-of-band stop request was received.
    StopRequested,

    /// The container was delivered to shared storage.
    Completed {
        /// Final location of the container.
        output: PathBuf,

        /// Whether any microphone buffer was observed.
        microphone_captured: bool,
    },

    /// The session was abandoned.
    Failed {
        /// Error message.
        message: String,
    },
}
