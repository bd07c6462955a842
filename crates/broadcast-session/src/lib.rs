//! Broadcast session controller.
//!
//! Drives one recording per host broadcast: resolves shared storage from the
//! extension configuration, records into a private scratch file through a
//! [`Multiplexer`](broadcast_muxer::Multiplexer), hands the finished file to
//! the shared location and listens for the out-of-band stop notification.

mod config;
mod controller;
mod error;
pub mod notify;
mod shared_record;
mod storage;

pub use config::ExtensionConfig;
pub use controller::{BroadcastHost, SessionController, WriterFactory};
pub use error::{SessionError, SessionResult};
pub use notify::{
    LocalNotificationBus, NotificationBus, NotificationHandler, Subscription,
    STOP_BROADCAST_NOTIFICATION,
};
#[cfg(unix)]
pub use notify::UnixNotificationBus;
pub use shared_record::{SharedDefaults, MIC_RECORD_KEY};
pub use storage::{is_container_file, prepare_scratch_path, purge_stale_recordings, relocate_recording};
