//! Scripted in-memory container writer.
//!
//! Keeps every appended sample in memory and lets a test decide readiness,
//! codec support and how finalization ends. A [`MemoryHandle`] stays with the
//! test after the writer itself is moved into a multiplexer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use broadcast_ipc::TrackKind;
use broadcast_writer::{
    ContainerWriter, FinishCallback, TimedSample, TrackConfig, VideoCodec, WriterError,
    WriterResult, WriterStatus,
};

/// How [`ContainerWriter::finish_writing`] ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishBehavior {
    /// Report success.
    Complete,
    /// Report a writer fault with this description.
    Fail(String),
    /// Keep the callback until [`MemoryHandle::release_pending_finish`].
    Never,
    /// Drop the callback without calling it.
    Drop,
}

struct MemoryState {
    status: WriterStatus,
    error: Option<String>,
    supports_hevc: bool,
    supports_audio: bool,
    tracks: HashMap<TrackKind, TrackConfig>,
    not_ready: Vec<TrackKind>,
    finished: Vec<TrackKind>,
    samples: HashMap<TrackKind, Vec<TimedSample>>,
    finish_behavior: FinishBehavior,
    pending_finish: Option<FinishCallback>,
    add_track_error: Option<String>,
    start_error: Option<String>,
}

/// In-memory [`ContainerWriter`].
pub struct MemoryWriter {
    path: PathBuf,
    state: Arc<Mutex<MemoryState>>,
}

/// Test-side view of a [`MemoryWriter`].
#[derive(Clone)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryWriter {
    /// Create a writer reporting `path` as its destination.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Arc::new(Mutex::new(MemoryState {
                status: WriterStatus::Unknown,
                error: None,
                supports_hevc: false,
                supports_audio: true,
                tracks: HashMap::new(),
                not_ready: Vec::new(),
                finished: Vec::new(),
                samples: HashMap::new(),
                finish_behavior: FinishBehavior::Complete,
                pending_finish: None,
                add_track_error: None,
                start_error: None,
            })),
        }
    }

    /// Get a handle for scripting and inspection.
    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl MemoryHandle {
    /// Accept HEVC video configurations.
    pub fn set_supports_hevc(&self, supported: bool) {
        self.state.lock().supports_hevc = supported;
    }

    /// Accept audio configurations.
    pub fn set_supports_audio(&self, supported: bool) {
        self.state.lock().supports_audio = supported;
    }

    /// Control whether a track reports ready.
    pub fn set_ready(&self, kind: TrackKind, ready: bool) {
        let mut state = self.state.lock();
        state.not_ready.retain(|k| *k != kind);
        if !ready {
            state.not_ready.push(kind);
        }
    }

    /// Choose how finalization ends.
    pub fn set_finish_behavior(&self, behavior: FinishBehavior) {
        self.state.lock().finish_behavior = behavior;
    }

    /// Make every following `add_track` fail with `message`.
    pub fn fail_add_track(&self, message: &str) {
        self.state.lock().add_track_error = Some(message.to_string());
    }

    /// Make `start_writing` fail with `message`.
    pub fn fail_start(&self, message: &str) {
        self.state.lock().start_error = Some(message.to_string());
    }

    /// Fault the writer as if the platform reported an error.
    pub fn fail_now(&self, message: &str) {
        let mut state = self.state.lock();
        state.status = WriterStatus::Failed;
        state.error = Some(message.to_string());
    }

    /// Run a callback held back by [`FinishBehavior::Never`].
    pub fn release_pending_finish(&self, result: WriterResult<()>) -> bool {
        let callback = {
            let mut state = self.state.lock();
            if result.is_ok() {
                state.status = WriterStatus::Completed;
            }
            state.pending_finish.take()
        };
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Writer status.
    pub fn status(&self) -> WriterStatus {
        self.state.lock().status
    }

    /// Samples appended to a track, in order.
    pub fn samples(&self, kind: TrackKind) -> Vec<TimedSample> {
        self.state
            .lock()
            .samples
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Configuration a track was registered with.
    pub fn track_config(&self, kind: TrackKind) -> Option<TrackConfig> {
        self.state.lock().tracks.get(&kind).cloned()
    }

    /// Registered tracks, in canonical order.
    pub fn registered_tracks(&self) -> Vec<TrackKind> {
        let state = self.state.lock();
        TrackKind::ALL
            .into_iter()
            .filter(|kind| state.tracks.contains_key(kind))
            .collect()
    }

    /// Every `mark_finished` call, in order.
    pub fn finished_marks(&self) -> Vec<TrackKind> {
        self.state.lock().finished.clone()
    }
}

impl ContainerWriter for MemoryWriter {
    fn output_path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> WriterStatus {
        self.state.lock().status
    }

    fn last_error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    fn can_add(&self, config: &TrackConfig) -> bool {
        let state = self.state.lock();
        match config {
            TrackConfig::Video(video) => video.codec != VideoCodec::Hevc || state.supports_hevc,
            TrackConfig::Audio(_) => state.supports_audio,
        }
    }

    fn add_track(&mut self, kind: TrackKind, config: TrackConfig) -> WriterResult<()> {
        let mut state = self.state.lock();
        if state.status != WriterStatus::Unknown {
            return Err(WriterError::WrongStatus(state.status));
        }
        if let Some(message) = state.add_track_error.clone() {
            return Err(WriterError::Failed(message));
        }
        state.tracks.insert(kind, config);
        Ok(())
    }

    fn start_writing(&mut self) -> WriterResult<()> {
        let mut state = self.state.lock();
        if state.status != WriterStatus::Unknown {
            return Err(WriterError::WrongStatus(state.status));
        }
        if let Some(message) = state.start_error.clone() {
            return Err(WriterError::Failed(message));
        }
        state.status = WriterStatus::Writing;
        Ok(())
    }

    fn is_ready(&self, kind: TrackKind) -> bool {
        let state = self.state.lock();
        state.status == WriterStatus::Writing
            && state.tracks.contains_key(&kind)
            && !state.finished.contains(&kind)
            && !state.not_ready.contains(&kind)
    }

    fn append(&mut self, kind: TrackKind, sample: TimedSample) -> WriterResult<bool> {
        let mut state = self.state.lock();
        match state.status {
            WriterStatus::Writing => {}
            WriterStatus::Failed => {
                return Err(WriterError::Failed(state.error.clone().unwrap_or_default()))
            }
            other => return Err(WriterError::WrongStatus(other)),
        }
        if !state.tracks.contains_key(&kind) {
            return Err(WriterError::UnknownTrack(kind));
        }
        if state.finished.contains(&kind) || state.not_ready.contains(&kind) {
            return Ok(false);
        }
        state.samples.entry(kind).or_default().push(sample);
        Ok(true)
    }

    fn mark_finished(&mut self, kind: TrackKind) {
        self.state.lock().finished.push(kind);
    }

    fn finish_writing(&mut self, on_complete: FinishCallback) {
        let outcome = {
            let mut state = self.state.lock();
            if state.status != WriterStatus::Writing {
                Some(Err(WriterError::WrongStatus(state.status)))
            } else {
                match state.finish_behavior.clone() {
                    FinishBehavior::Complete => {
                        state.status = WriterStatus::Completed;
                        Some(Ok(()))
                    }
                    FinishBehavior::Fail(message) => {
                        state.status = WriterStatus::Failed;
                        state.error = Some(message.clone());
                        Some(Err(WriterError::Failed(message)))
                    }
                    FinishBehavior::Never => {
                        state.pending_finish = Some(on_complete);
                        return;
                    }
                    FinishBehavior::Drop => None,
                }
            }
        };

        if let Some(result) = outcome {
            on_complete(result);
        }
    }

    fn cancel(&mut self) {
        let mut state = self.state.lock();
        if matches!(state.status, WriterStatus::Unknown | WriterStatus::Writing) {
            state.status = WriterStatus::Cancelled;
        }
    }
}
