//! Session controller lifecycle against real and scripted writers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;

use broadcast_ipc::{event_channel, SampleBuffer, SessionEvent, SessionState, SetupInfo, TrackKind};
use broadcast_muxer::memory::{FinishBehavior, MemoryHandle, MemoryWriter};
use broadcast_session::{
    is_container_file, BroadcastHost, ExtensionConfig, LocalNotificationBus, NotificationBus,
    SessionController, SessionError, SessionResult, SharedDefaults, MIC_RECORD_KEY,
    STOP_BROADCAST_NOTIFICATION,
};
use broadcast_writer::{inspect_container, ContainerWriter, TrackMedia};

const MS: u64 = 10_000;
const GROUP: &str = "group.com.example.coach";

#[derive(Default)]
struct RecordingHost {
    errors: Mutex<Vec<String>>,
    graceful: AtomicUsize,
}

impl BroadcastHost for RecordingHost {
    fn finish_with_error(&self, error: &SessionError) {
        self.errors.lock().push(error.to_string());
    }

    fn finish_gracefully(&self) {
        self.graceful.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    dir: TempDir,
    host: Arc<RecordingHost>,
    bus: Arc<LocalNotificationBus>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            host: Arc::new(RecordingHost::default()),
            bus: Arc::new(LocalNotificationBus::new()),
        }
    }

    fn config(&self) -> ExtensionConfig {
        ExtensionConfig::default()
            .with_app_group(GROUP)
            .with_container_root(self.dir.path().join("containers"))
            .with_scratch_dir(self.dir.path().join("scratch"))
            .with_notification_dir(self.dir.path().join("notify"))
    }

    fn controller(&self, config: ExtensionConfig) -> SessionController {
        SessionController::new(config, self.bus.clone(), self.host.clone())
    }

    fn shared_dir(&self) -> PathBuf {
        self.config().shared_documents_dir().unwrap()
    }

    fn scratch_files(&self) -> Vec<PathBuf> {
        list(&self.dir.path().join("scratch"))
    }

    fn mic_record(&self) -> Option<bool> {
        SharedDefaults::open(self.config().shared_record_path().unwrap())
            .bool(MIC_RECORD_KEY)
            .unwrap()
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|e| e.path()).collect())
        .unwrap_or_default()
}

fn setup_info() -> SetupInfo {
    SetupInfo {
        screen: broadcast_ipc::ScreenGeometry::new(320.0, 240.0, 2.0),
    }
}

fn keyframe(ms: u64) -> SampleBuffer {
    SampleBuffer::new(
        ms * MS,
        Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, 0xAB, // SPS
            0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80, // PPS
            0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21, // IDR
        ]),
    )
    .with_keyframe(true)
}

fn delta(ms: u64) -> SampleBuffer {
    SampleBuffer::new(ms * MS, Bytes::from_static(&[0x00, 0x00, 0x01, 0x41, 0x9A, 0x22]))
}

fn audio(ms: u64) -> SampleBuffer {
    SampleBuffer::new(ms * MS, Bytes::from_static(&[0x21, 0x10, 0x04, 0x60]))
}

/// Forward a buffer until the track has room for it.
fn feed(controller: &SessionController, buffer: SampleBuffer, kind: TrackKind) {
    for _ in 0..2000 {
        if controller.on_buffer(&buffer, kind) {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("{} buffer never accepted", kind.name());
}

fn record_clip(controller: &SessionController, with_mic: bool) {
    feed(controller, keyframe(0), TrackKind::Video);
    for i in 1..10 {
        feed(controller, delta(i * 33), TrackKind::Video);
        feed(controller, audio(i * 23), TrackKind::AppAudio);
        if with_mic {
            feed(controller, audio(3 + i * 23), TrackKind::MicAudio);
        }
    }
}

/// Writer factory handing out scripted writers; the scratch file is created
/// so it can be relocated.
fn memory_factory(
    handles: Arc<Mutex<Vec<MemoryHandle>>>,
    behavior: FinishBehavior,
) -> broadcast_session::WriterFactory {
    Box::new(
        move |path: &Path, _config: &ExtensionConfig| -> SessionResult<Box<dyn ContainerWriter>> {
            fs::write(path, b"scripted")?;
            let writer = MemoryWriter::new(path);
            let handle = writer.handle();
            handle.set_finish_behavior(behavior.clone());
            handles.lock().push(handle);
            Ok(Box::new(writer))
        },
    )
}

#[test]
fn test_full_session_delivers_recording() {
    let fixture = Fixture::new();
    let (event_tx, event_rx) = event_channel();
    let controller = fixture.controller(fixture.config()).with_events(event_tx);

    controller.on_session_start(&setup_info()).unwrap();
    assert!(controller.state().is_active());
    assert_eq!(fixture.scratch_files().len(), 1);

    record_clip(&controller, true);
    assert!(controller.microphone_observed());

    let output = controller.on_session_end().unwrap();
    assert_eq!(output.parent().unwrap(), fixture.shared_dir());
    assert!(is_container_file(&output));
    assert!(fixture.scratch_files().is_empty());
    assert_eq!(fixture.mic_record(), Some(true));
    assert_eq!(controller.state(), SessionState::Finished { output: output.clone() });

    let summary = inspect_container(&output).unwrap();
    assert_eq!(summary.track(TrackMedia::Video).unwrap().sample_count, 10);
    assert_eq!(summary.count(TrackMedia::Audio), 2);

    let events: Vec<SessionEvent> = event_rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Completed { microphone_captured: true, .. }
    )));
    assert!(fixture.host.errors.lock().is_empty());
}

#[test]
fn test_session_without_microphone() {
    let fixture = Fixture::new();
    let controller = fixture.controller(fixture.config());

    controller.on_session_start(&setup_info()).unwrap();
    record_clip(&controller, false);
    let output = controller.on_session_end().unwrap();

    assert_eq!(fixture.mic_record(), Some(false));
    let summary = inspect_container(&output).unwrap();
    assert_eq!(summary.count(TrackMedia::Audio), 1);
}

#[test]
fn test_stale_recordings_are_purged_at_start() {
    let fixture = Fixture::new();
    let shared = fixture.shared_dir();
    fs::create_dir_all(&shared).unwrap();
    fs::write(shared.join("yesterday.mp4"), b"old").unwrap();
    fs::write(shared.join("last-week.MP4"), b"old").unwrap();
    fs::write(shared.join("keep.json"), b"{}").unwrap();

    let controller = fixture.controller(fixture.config());
    controller.on_session_start(&setup_info()).unwrap();

    let remaining = list(&shared);
    assert_eq!(remaining.iter().filter(|p| is_container_file(p)).count(), 0);
    assert_eq!(remaining.len(), 1);
}

#[test]
fn test_missing_app_group_fails_before_writer() {
    let fixture = Fixture::new();
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);

    let mut config = fixture.config();
    config.app_group_identifier = None;
    let controller = fixture.controller(config).with_writer_factory(Box::new(
        move |path: &Path, _config: &ExtensionConfig| -> SessionResult<Box<dyn ContainerWriter>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MemoryWriter::new(path)))
        },
    ));

    assert!(matches!(
        controller.on_session_start(&setup_info()),
        Err(SessionError::MissingAppGroup)
    ));
    assert_eq!(created.load(Ordering::SeqCst), 0);
    assert!(fixture.scratch_files().is_empty());
    assert_eq!(fixture.host.errors.lock().len(), 1);
    assert!(matches!(controller.state(), SessionState::Error { .. }));

    assert!(!controller.on_buffer(&keyframe(0), TrackKind::Video));
    assert_eq!(controller.on_session_end(), None);
}

#[test]
fn test_configuration_file_is_read_at_each_start() {
    let fixture = Fixture::new();
    let path = fixture.dir.path().join("extension.json");
    let controller =
        SessionController::from_config_file(&path, fixture.bus.clone(), fixture.host.clone());

    assert!(matches!(
        controller.on_session_start(&setup_info()),
        Err(SessionError::Config { .. })
    ));

    let mut ungrouped = fixture.config();
    ungrouped.app_group_identifier = None;
    fs::write(&path, serde_json::to_string(&ungrouped).unwrap()).unwrap();
    assert!(matches!(
        controller.on_session_start(&setup_info()),
        Err(SessionError::MissingAppGroup)
    ));
    assert!(fixture.scratch_files().is_empty());

    fs::write(&path, serde_json::to_string(&fixture.config()).unwrap()).unwrap();
    controller.on_session_start(&setup_info()).unwrap();
    assert_eq!(controller.config().app_group_identifier.as_deref(), Some(GROUP));

    record_clip(&controller, false);
    let output = controller.on_session_end().unwrap();
    assert_eq!(output.parent().unwrap(), fixture.shared_dir());
    assert_eq!(fixture.host.errors.lock().len(), 2);
}

#[test]
fn test_second_start_is_rejected() {
    let fixture = Fixture::new();
    let controller = fixture.controller(fixture.config());

    controller.on_session_start(&setup_info()).unwrap();
    let recording = controller.state();

    assert!(matches!(
        controller.on_session_start(&setup_info()),
        Err(SessionError::AlreadyActive)
    ));
    assert_eq!(controller.state(), recording);
    assert!(fixture.host.errors.lock().is_empty());
    assert_eq!(fixture.scratch_files().len(), 1);

    // The running session is unaffected and still delivers.
    record_clip(&controller, false);
    assert!(controller.on_session_end().is_some());
}

#[test]
fn test_buffers_outside_session_are_dropped() {
    let fixture = Fixture::new();
    let controller = fixture.controller(fixture.config());

    assert!(!controller.on_buffer(&audio(0), TrackKind::MicAudio));
    assert!(!controller.microphone_observed());
    assert_eq!(controller.on_session_end(), None);
}

#[test]
fn test_stop_notification_ends_session() {
    let fixture = Fixture::new();
    let (event_tx, event_rx) = event_channel();
    let controller = fixture.controller(fixture.config()).with_events(event_tx);

    controller.on_session_start(&setup_info()).unwrap();
    record_clip(&controller, false);

    assert_eq!(fixture.bus.post(STOP_BROADCAST_NOTIFICATION).unwrap(), 1);

    assert_eq!(fixture.host.graceful.load(Ordering::SeqCst), 1);
    assert!(matches!(controller.state(), SessionState::Finished { .. }));
    assert_eq!(list(&fixture.shared_dir()).len(), 1);
    assert_eq!(fixture.bus.subscriber_count(STOP_BROADCAST_NOTIFICATION), 0);

    // The host's own end callback afterwards finds nothing left to do.
    assert_eq!(controller.on_session_end(), None);

    let events: Vec<SessionEvent> = event_rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, SessionEvent::StopRequested)));
}

#[test]
fn test_pause_and_resume_states() {
    let fixture = Fixture::new();
    let controller = fixture.controller(fixture.config());

    controller.on_session_start(&setup_info()).unwrap();
    controller.on_pause();
    assert!(matches!(controller.state(), SessionState::Paused { .. }));
    assert!(controller.metrics().unwrap().paused);

    controller.on_resume();
    assert!(matches!(controller.state(), SessionState::Recording { .. }));
    assert!(!controller.metrics().unwrap().paused);
}

#[test]
fn test_writer_fault_is_reported_to_host() {
    let fixture = Fixture::new();
    let handles = Arc::new(Mutex::new(Vec::new()));
    let controller = fixture
        .controller(fixture.config())
        .with_writer_factory(memory_factory(handles.clone(), FinishBehavior::Complete));

    controller.on_session_start(&setup_info()).unwrap();
    assert!(controller.on_buffer(&delta(0), TrackKind::Video));

    handles.lock()[0].fail_now("media services reset");
    assert!(!controller.on_buffer(&delta(33), TrackKind::Video));
    assert!(!controller.on_buffer(&delta(66), TrackKind::Video));

    let errors = fixture.host.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("media services reset"));
}

#[test]
fn test_failed_finish_abandons_recording() {
    let fixture = Fixture::new();
    let handles = Arc::new(Mutex::new(Vec::new()));
    let controller = fixture.controller(fixture.config()).with_writer_factory(memory_factory(
        handles.clone(),
        FinishBehavior::Fail("disk full".to_string()),
    ));

    controller.on_session_start(&setup_info()).unwrap();
    assert!(controller.on_buffer(&audio(0), TrackKind::MicAudio));

    assert_eq!(controller.on_session_end(), None);
    assert!(matches!(controller.state(), SessionState::Error { .. }));
    assert!(fixture.scratch_files().is_empty());
    assert!(list(&fixture.shared_dir()).is_empty());
    assert_eq!(fixture.mic_record(), None);
    assert!(fixture.host.errors.lock().is_empty());
}

#[test]
fn test_scripted_session_records_microphone_flag() {
    let fixture = Fixture::new();
    let handles = Arc::new(Mutex::new(Vec::new()));
    let controller = fixture
        .controller(fixture.config())
        .with_writer_factory(memory_factory(handles.clone(), FinishBehavior::Complete));

    controller.on_session_start(&setup_info()).unwrap();
    assert!(controller.on_buffer(&audio(10), TrackKind::AppAudio));
    assert!(controller.on_buffer(&audio(12), TrackKind::MicAudio));

    let output = controller.on_session_end().unwrap();
    assert_eq!(fs::read(&output).unwrap(), b"scripted");
    assert_eq!(fixture.mic_record(), Some(true));

    let handles = handles.lock();
    let handle = &handles[0];
    assert_eq!(handle.samples(TrackKind::MicAudio)[0].pts_100ns, 2 * MS);
    assert_eq!(handle.finished_marks().len(), 3);
}

#[cfg(unix)]
#[test]
fn test_stop_over_unix_bus() {
    use broadcast_session::UnixNotificationBus;

    let fixture = Fixture::new();
    let config = fixture.config();
    let bus = Arc::new(UnixNotificationBus::new(&config.notification_dir));
    let controller = SessionController::new(config.clone(), bus, fixture.host.clone());

    controller.on_session_start(&setup_info()).unwrap();
    record_clip(&controller, false);

    let poster = UnixNotificationBus::new(&config.notification_dir);
    assert_eq!(poster.post(STOP_BROADCAST_NOTIFICATION).unwrap(), 1);

    for _ in 0..500 {
        if fixture.host.graceful.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(fixture.host.graceful.load(Ordering::SeqCst), 1);
    assert!(matches!(controller.state(), SessionState::Finished { .. }));
    assert_eq!(poster.post(STOP_BROADCAST_NOTIFICATION).unwrap(), 0);
}
