//! In-process notification bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::{NotificationBus, NotificationHandler, Subscription};
use crate::error::SessionResult;

/// Delivers posts synchronously on the posting thread.
#[derive(Default)]
pub struct LocalNotificationBus {
    handlers: Mutex<HashMap<String, Vec<(u64, NotificationHandler)>>>,
    next_id: AtomicU64,
}

impl LocalNotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers registered for `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.handlers.lock().get(name).map_or(0, Vec::len)
    }
}

impl NotificationBus for LocalNotificationBus {
    fn subscribe(&self, name: &str, handler: NotificationHandler) -> SessionResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(name.to_string())
            .or_default()
            .push((id, handler));
        trace!(name, id, "Subscribed");
        Ok(Subscription::new(name, id))
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        let mut handlers = self.handlers.lock();
        if let Some(list) = handlers.get_mut(subscription.name()) {
            list.retain(|(id, _)| *id != subscription.id());
            if list.is_empty() {
                handlers.remove(subscription.name());
            }
        }
    }

    fn post(&self, name: &str) -> SessionResult<usize> {
        // Handlers run without the lock so they may unsubscribe themselves.
        let targets: Vec<NotificationHandler> = self
            .handlers
            .lock()
            .get(name)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in &targets {
            handler();
        }
        Ok(targets.len())
    }
}
