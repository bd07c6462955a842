//! Container and session state machine types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle of one container being written.
///
/// `Unstarted → Writing → Finishing → {Completed | Failed}`, with
/// `Cancelled` reachable from `Writing` on teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Created, no track registered yet.
    #[default]
    Unstarted,

    /// Tracks registered, accepting samples.
    Writing,

    /// Tracks finished, finalization in flight.
    Finishing,

    /// Container finalized successfully.
    Completed,

    /// The writer reported a fault.
    Failed,

    /// Torn down without finalizing.
    Cancelled,
}

impl ContainerStatus {
    /// Returns true if samples may be appended.
    pub fn is_writing(self) -> bool {
        matches!(self, Self::Writing)
    }

    /// Returns a simple string representation of the status.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unstarted => "Unstarted",
            Self::Writing => "Writing",
            Self::Finishing => "Finishing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The current state of a broadcast recording session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session has started.
    #[default]
    Idle,

    /// Resolving storage and starting the multiplexer.
    Starting,

    /// Recording into the scratch file.
    Recording {
        /// Private scratch path of the container.
        scratch: PathBuf,
    },

    /// Host paused the broadcast.
    Paused {
        /// Private scratch path of the container.
        scratch: PathBuf,
    },

    /// Finalizing and handing off the container.
    Stopping,

    /// The container was delivered to shared storage.
    Finished {
        /// Final location in shared storage.
        output: PathBuf,
    },

    /// The session was abandoned.
    Error {
        /// Error message.
        message: String,
    },
}

impl SessionState {
    /// Returns true while samples are being recorded or the session is paused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Recording { .. } | Self::Paused { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Recording { .. } => "Recording",
            Self::Paused { .. } => "Paused",
            Self::Stopping => "Stopping",
            Self::Finished { .. } => "Finished",
            Self::Error { .. } => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_writing_accepts_samples() {
        assert!(ContainerStatus::Writing.is_writing());
        assert!(!ContainerStatus::Unstarted.is_writing());
        assert!(!ContainerStatus::Finishing.is_writing());
        assert!(!ContainerStatus::Cancelled.is_writing());
    }

    #[test]
    fn test_session_state_activity() {
        let scratch = PathBuf::from("/tmp/a.mp4");
        assert!(SessionState::Recording { scratch: scratch.clone() }.is_active());
        assert!(SessionState::Paused { scratch }.is_active());
        assert!(!SessionState::Stopping.is_active());
        assert!(!SessionState::Idle.is_active());
    }

    #[test]
    fn test_container_status_display() {
        assert_eq!(ContainerStatus::Writing.to_string(), "Writing");
    }
}
