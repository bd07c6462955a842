//! Session controller driven by the host broadcast lifecycle.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use broadcast_ipc::{SampleBuffer, SessionEvent, SessionState, SetupInfo, TrackKind};
use broadcast_muxer::{MetricsSnapshot, Multiplexer};
use broadcast_writer::{ContainerWriter, Mp4FileWriter};

use crate::config::ExtensionConfig;
use crate::error::{SessionError, SessionResult};
use crate::notify::{NotificationBus, NotificationHandler, Subscription, STOP_BROADCAST_NOTIFICATION};
use crate::shared_record::{SharedDefaults, MIC_RECORD_KEY};
use crate::storage::{prepare_scratch_path, purge_stale_recordings, relocate_recording};

/// The host side of a broadcast: the environment that owns the session.
pub trait BroadcastHost: Send + Sync {
    /// End the broadcast and surface `error` to the user.
    fn finish_with_error(&self, error: &SessionError);

    /// End the broadcast normally.
    fn finish_gracefully(&self);
}

/// Builds the container writer for a scratch path.
pub type WriterFactory =
    Box<dyn Fn(&Path, &ExtensionConfig) -> SessionResult<Box<dyn ContainerWriter>> + Send + Sync>;

fn create_mp4_writer(
    path: &Path,
    config: &ExtensionConfig,
) -> SessionResult<Box<dyn ContainerWriter>> {
    let writer = Mp4FileWriter::with_queue_capacity(path, config.track_queue_capacity)?;
    Ok(Box::new(writer))
}

/// Runs one broadcast session at a time.
///
/// Host callbacks may arrive on any thread. Buffers of different kinds may be
/// forwarded concurrently; the end of a session waits for in-flight buffers.
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: RwLock<ExtensionConfig>,
    config_path: Option<PathBuf>,
    bus: Arc<dyn NotificationBus>,
    host: Arc<dyn BroadcastHost>,
    writer_factory: RwLock<WriterFactory>,
    event_tx: RwLock<Option<Sender<SessionEvent>>>,
    state: RwLock<SessionState>,
    muxer: RwLock<Option<Multiplexer>>,
    shared_dir: Mutex<Option<PathBuf>>,
    subscription: Mutex<Option<Subscription>>,
    saw_microphone: AtomicBool,
}

impl SessionController {
    /// Create a controller writing MP4 files with a fixed configuration.
    pub fn new(
        config: ExtensionConfig,
        bus: Arc<dyn NotificationBus>,
        host: Arc<dyn BroadcastHost>,
    ) -> Self {
        Self::build(config, None, bus, host)
    }

    /// Create a controller that reads `path` at every session start.
    pub fn from_config_file(
        path: impl Into<PathBuf>,
        bus: Arc<dyn NotificationBus>,
        host: Arc<dyn BroadcastHost>,
    ) -> Self {
        Self::build(ExtensionConfig::default(), Some(path.into()), bus, host)
    }

    fn build(
        config: ExtensionConfig,
        config_path: Option<PathBuf>,
        bus: Arc<dyn NotificationBus>,
        host: Arc<dyn BroadcastHost>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                config: RwLock::new(config),
                config_path,
                bus,
                host,
                writer_factory: RwLock::new(Box::new(create_mp4_writer)),
                event_tx: RwLock::new(None),
                state: RwLock::new(SessionState::Idle),
                muxer: RwLock::new(None),
                shared_dir: Mutex::new(None),
                subscription: Mutex::new(None),
                saw_microphone: AtomicBool::new(false),
            }),
        }
    }

    /// Use a different container writer.
    pub fn with_writer_factory(self, factory: WriterFactory) -> Self {
        *self.inner.writer_factory.write() = factory;
        self
    }

    /// Report session events on `event_tx`.
    pub fn with_events(self, event_tx: Sender<SessionEvent>) -> Self {
        *self.inner.event_tx.write() = Some(event_tx);
        self
    }

    /// Configuration of the current or last session.
    pub fn config(&self) -> ExtensionConfig {
        self.inner.config.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.read().clone()
    }

    /// Whether any microphone buffer reached the controller this session.
    pub fn microphone_observed(&self) -> bool {
        self.inner.saw_microphone.load(Ordering::SeqCst)
    }

    /// Ingestion counters of the running session.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.muxer.read().as_ref().map(Multiplexer::metrics)
    }

    /// The host started a broadcast.
    ///
    /// Errors are also reported to the host before being returned. A start
    /// while a session is active is rejected without touching that session.
    #[instrument(name = "session_start", skip_all)]
    pub fn on_session_start(&self, setup: &SetupInfo) -> SessionResult<()> {
        let result = self.inner.start(setup);
        match &result {
            Err(SessionError::AlreadyActive) => warn!("Ignoring start while a session is active"),
            Err(e) => {
                error!("Session failed to start: {}", e);
                self.inner.transition_to(SessionState::Error {
                    message: e.to_string(),
                });
                self.inner.send_event(SessionEvent::Failed {
                    message: e.to_string(),
                });
                self.inner.host.finish_with_error(e);
            }
            Ok(()) => {}
        }
        result
    }

    /// Forward one sample buffer. Returns whether it was appended.
    pub fn on_buffer(&self, buffer: &SampleBuffer, kind: TrackKind) -> bool {
        self.inner.process(buffer, kind)
    }

    pub fn on_pause(&self) {
        self.inner.set_paused(true);
    }

    pub fn on_resume(&self) {
        self.inner.set_paused(false);
    }

    /// The host ended the broadcast. Returns the delivered file, if any.
    ///
    /// Failures abandon the recording and are only logged.
    #[instrument(name = "session_end", skip_all)]
    pub fn on_session_end(&self) -> Option<PathBuf> {
        self.inner.end()
    }
}

impl ControllerInner {
    fn start(self: &Arc<Self>, setup: &SetupInfo) -> SessionResult<()> {
        if self.muxer.read().is_some() {
            return Err(SessionError::AlreadyActive);
        }
        self.transition_to(SessionState::Starting);

        let config = self.load_config()?;
        let shared_dir = config.shared_documents_dir()?;
        purge_stale_recordings(&shared_dir);

        let scratch = prepare_scratch_path(&config.scratch_dir)?;
        let writer = {
            let factory = self.writer_factory.read();
            (*factory)(&scratch, &config)?
        };
        let muxer = Multiplexer::new(writer, config.muxer_config(setup.screen))?;
        muxer.start()?;

        let subscription = self.subscribe_stop()?;

        self.saw_microphone.store(false, Ordering::SeqCst);
        *self.shared_dir.lock() = Some(shared_dir);
        *self.subscription.lock() = Some(subscription);
        *self.muxer.write() = Some(muxer);

        info!(scratch = %scratch.display(), "Session recording");
        self.transition_to(SessionState::Recording { scratch });
        Ok(())
    }

    /// Re-read the configuration file, if any, and make it current.
    fn load_config(&self) -> SessionResult<ExtensionConfig> {
        let Some(path) = &self.config_path else {
            return Ok(self.config.read().clone());
        };
        let config = ExtensionConfig::load(path)?;
        *self.config.write() = config.clone();
        Ok(config)
    }

    fn subscribe_stop(self: &Arc<Self>) -> SessionResult<Subscription> {
        let owner: Weak<Self> = Arc::downgrade(self);
        let handler: NotificationHandler = Arc::new(move || {
            if let Some(inner) = owner.upgrade() {
                inner.on_stop_signal();
            }
        });
        self.bus.subscribe(STOP_BROADCAST_NOTIFICATION, handler)
    }

    fn unsubscribe_stop(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            self.bus.unsubscribe(&subscription);
        }
    }

    fn process(&self, buffer: &SampleBuffer, kind: TrackKind) -> bool {
        let result = {
            let muxer = self.muxer.read();
            let Some(muxer) = muxer.as_ref() else {
                return false;
            };
            if kind == TrackKind::MicAudio {
                self.saw_microphone.store(true, Ordering::SeqCst);
            }
            muxer.process_buffer(buffer, kind)
        };

        match result {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(track = kind.name(), "Buffer failed: {}", e);
                self.host.finish_with_error(&SessionError::Muxer(e));
                false
            }
        }
    }

    fn set_paused(&self, paused: bool) {
        let result = match self.muxer.read().as_ref() {
            Some(muxer) if paused => muxer.pause(),
            Some(muxer) => muxer.resume(),
            None => {
                debug!(paused, "No session to pause or resume");
                return;
            }
        };
        if let Err(e) = result {
            warn!("Pause hook failed: {}", e);
        }

        let next = match self.state.read().clone() {
            SessionState::Recording { scratch } if paused => Some(SessionState::Paused { scratch }),
            SessionState::Paused { scratch } if !paused => Some(SessionState::Recording { scratch }),
            _ => None,
        };
        if let Some(next) = next {
            self.transition_to(next);
        }
    }

    fn end(&self) -> Option<PathBuf> {
        // Taking the multiplexer waits for buffers still being forwarded.
        let Some(muxer) = self.muxer.write().take() else {
            debug!("No active session to end");
            return None;
        };
        self.unsubscribe_stop();
        self.transition_to(SessionState::Stopping);

        let scratch = muxer.output_path().to_path_buf();
        let result = self.deliver(&muxer);
        drop(muxer);

        match result {
            Ok(output) => {
                self.send_event(SessionEvent::Completed {
                    output: output.clone(),
                    microphone_captured: self.saw_microphone.load(Ordering::SeqCst),
                });
                self.transition_to(SessionState::Finished {
                    output: output.clone(),
                });
                Some(output)
            }
            Err(e) => {
                error!("Session abandoned: {}", e);
                discard(&scratch);
                self.send_event(SessionEvent::Failed {
                    message: e.to_string(),
                });
                self.transition_to(SessionState::Error {
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Finalize the container, hand it off and write the shared record.
    fn deliver(&self, muxer: &Multiplexer) -> SessionResult<PathBuf> {
        let recording = muxer.finish()?;

        let config = self.config.read().clone();
        let shared_dir = match self.shared_dir.lock().take() {
            Some(dir) => dir,
            None => config.shared_documents_dir()?,
        };
        let output = relocate_recording(&recording, &shared_dir)?;

        let microphone = self.saw_microphone.load(Ordering::SeqCst);
        SharedDefaults::open(config.shared_record_path()?).set_bool(MIC_RECORD_KEY, microphone)?;

        info!(output = %output.display(), microphone, "Session delivered");
        Ok(output)
    }

    fn on_stop_signal(&self) {
        info!("Stop requested by notification");
        self.send_event(SessionEvent::StopRequested);
        self.end();
        self.host.finish_gracefully();
    }

    fn transition_to(&self, new_state: SessionState) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state.clone())
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "Session state transition"
        );

        self.send_event(SessionEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: SessionEvent) {
        if let Some(event_tx) = self.event_tx.read().as_ref() {
            if let Err(e) = event_tx.try_send(event) {
                warn!("Failed to send event: {}", e);
            }
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            self.bus.unsubscribe(&subscription);
        }
    }
}

fn discard(scratch: &Path) {
    match fs::remove_file(scratch) {
        Ok(()) => debug!(path = %scratch.display(), "Removed abandoned recording"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %scratch.display(), "Failed to remove abandoned recording: {}", e),
    }
}
