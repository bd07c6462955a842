//! Named notifications between the host app and the broadcast extension.
//!
//! A post is delivered at most once to each current subscriber of the name.
//! Posting a name nobody listens to is not an error.

mod local;
#[cfg(unix)]
mod unix;

pub use local::LocalNotificationBus;
#[cfg(unix)]
pub use unix::UnixNotificationBus;

use std::sync::Arc;

use crate::error::SessionResult;

/// Name of the notification that asks a running broadcast to stop.
pub const STOP_BROADCAST_NOTIFICATION: &str = "com.nitroscreenrecorder.stopBroadcast";

/// Callback run when a subscribed notification is posted.
pub type NotificationHandler = Arc<dyn Fn() + Send + Sync>;

/// Token returned by [`NotificationBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    name: String,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(name: &str, id: u64) -> Self {
        Self {
            name: name.to_string(),
            id,
        }
    }

    /// Notification name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// A bus of named, payload-free notifications.
pub trait NotificationBus: Send + Sync {
    /// Register a handler for `name`.
    fn subscribe(&self, name: &str, handler: NotificationHandler) -> SessionResult<Subscription>;

    /// Remove a handler. Unknown subscriptions are ignored.
    fn unsubscribe(&self, subscription: &Subscription);

    /// Post `name`; returns how many subscribers it reached.
    fn post(&self, name: &str) -> SessionResult<usize>;
}
