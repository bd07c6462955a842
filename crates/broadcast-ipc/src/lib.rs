//! Shared sample, status and event types for the broadcast recorder.
//!
//! This crate defines the vocabulary used between the host broadcast
//! boundary, the multiplexer and the session controller.

mod events;
mod state;
mod types;

pub use events::SessionEvent;
pub use state::{ContainerStatus, SessionState};
pub use types::{SampleBuffer, ScreenGeometry, SetupInfo, TrackKind, TICKS_PER_SECOND};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for session events (Session → host app).
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Creates a bounded session event channel.
pub fn event_channel() -> (Sender<SessionEvent>, Receiver<SessionEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
