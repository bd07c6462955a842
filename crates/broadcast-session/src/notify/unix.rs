//! Cross-process notification bus over Unix datagram sockets.
//!
//! Each subscribed name is a socket `<dir>/<name>.sock`. A post sends one
//! datagram carrying the name; the subscriber's listener thread runs the
//! handler once per datagram.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{NotificationBus, NotificationHandler, Subscription};
use crate::error::{SessionError, SessionResult};

/// How often a listener checks its stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const MAX_NAME_LEN: usize = 256;

struct Listener {
    name: String,
    socket_path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            // A handler may unsubscribe from its own listener thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove notification socket: {}", e);
            }
        }
        debug!(name = %self.name, "Notification listener stopped");
    }
}

/// Notification bus shared by processes using the same directory.
pub struct UnixNotificationBus {
    dir: PathBuf,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl UnixNotificationBus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn socket_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.sock", name))
    }
}

impl NotificationBus for UnixNotificationBus {
    fn subscribe(&self, name: &str, handler: NotificationHandler) -> SessionResult<Subscription> {
        if self.listeners.lock().values().any(|l| l.name == name) {
            return Err(SessionError::Notification(format!(
                "{} already has a subscriber",
                name
            )));
        }

        fs::create_dir_all(&self.dir)?;
        let socket_path = self.socket_path(name);

        // A socket left behind by a process that died is dead weight.
        match fs::remove_file(&socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "Removed stale notification socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let socket = UnixDatagram::bind(&socket_path)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let stop = Arc::new(AtomicBool::new(false));
        let listener_stop = Arc::clone(&stop);
        let listener_name = name.to_string();

        let handle = thread::Builder::new()
            .name("notify-listener".to_string())
            .spawn(move || listen(socket, &listener_name, handler, listener_stop))
            .map_err(|e| {
                SessionError::Notification(format!("failed to spawn listener: {}", e))
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(
            id,
            Listener {
                name: name.to_string(),
                socket_path: socket_path.clone(),
                stop,
                thread: Some(handle),
            },
        );

        info!(name, path = %socket_path.display(), "Listening for notification");
        Ok(Subscription::new(name, id))
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        let listener = self.listeners.lock().remove(&subscription.id());
        if let Some(listener) = listener {
            listener.shutdown();
        }
    }

    fn post(&self, name: &str) -> SessionResult<usize> {
        let socket_path = self.socket_path(name);
        let socket = UnixDatagram::unbound()?;

        match socket.send_to(name.as_bytes(), &socket_path) {
            Ok(_) => {
                debug!(name, "Notification posted");
                Ok(1)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!(name, "No subscriber for notification");
                Ok(0)
            }
            Err(e) => Err(SessionError::Notification(format!(
                "failed to post {}: {}",
                name, e
            ))),
        }
    }
}

impl Drop for UnixNotificationBus {
    fn drop(&mut self) {
        let listeners: Vec<Listener> = self.listeners.lock().drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.shutdown();
        }
    }
}

fn listen(socket: UnixDatagram, name: &str, handler: NotificationHandler, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; MAX_NAME_LEN];

    while !stop.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(len) if &buf[..len] == name.as_bytes() => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                info!(name, "Notification received");
                handler();
            }
            Ok(len) => debug!(len, "Ignoring unexpected datagram"),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!(name, "Notification listener failed: {}", e);
                break;
            }
        }
    }
}
