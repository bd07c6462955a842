//! Container writer capability and MP4 file writer.
//!
//! The multiplexer talks to the platform's container writer only through
//! [`ContainerWriter`]. [`Mp4FileWriter`] is the file-backed implementation:
//! it takes already-encoded samples and muxes them into an MP4 file on a
//! worker thread, with a bounded queue per track.

mod error;
mod inspect;
mod mp4_file;
pub mod nal;

pub use error::WriterError;
pub use inspect::{inspect_container, ContainerSummary, TrackMedia, TrackSummary};
pub use mp4_file::Mp4FileWriter;

use std::path::Path;

use broadcast_ipc::TrackKind;
use bytes::Bytes;

/// Queue depth per track before the track reports it is not ready.
pub const TRACK_QUEUE_CAPACITY: usize = 8;

/// File extension of finished containers.
pub const CONTAINER_EXTENSION: &str = "mp4";

/// Result type for writer operations.
pub type WriterResult<T> = Result<T, WriterError>;

/// Completion callback handed to [`ContainerWriter::finish_writing`].
pub type FinishCallback = Box<dyn FnOnce(WriterResult<()>) + Send + 'static>;

/// Video codecs a writer may be asked to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// H.265 / HEVC.
    Hevc,

    /// H.264 / AVC.
    H264,
}

/// Video track configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrackConfig {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Codec of the incoming samples.
    pub codec: VideoCodec,

    /// Expected source frame rate.
    pub expected_fps: u32,
}

impl Default for VideoTrackConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            codec: VideoCodec::H264,
            expected_fps: 60,
        }
    }
}

/// Audio track configuration (AAC).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrackConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Number of channels.
    pub channels: u16,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,
}

impl Default for AudioTrackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
            bitrate_kbps: 128,
        }
    }
}

/// Encoder configuration of a single track.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackConfig {
    Video(VideoTrackConfig),
    Audio(AudioTrackConfig),
}

/// A sample ready for the container, timed relative to the session anchor.
#[derive(Debug, Clone)]
pub struct TimedSample {
    /// Presentation timestamp in 100ns units, zero at the session anchor.
    pub pts_100ns: u64,

    /// Whether this is a sync sample.
    pub is_keyframe: bool,

    /// Encoded payload.
    pub data: Bytes,
}

/// Status reported by the writer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    /// Tracks may still be added.
    Unknown,

    /// Accepting samples.
    Writing,

    /// Finalized successfully.
    Completed,

    /// Faulted; see [`ContainerWriter::last_error`].
    Failed,

    /// Abandoned without finalizing.
    Cancelled,
}

impl WriterStatus {
    /// Returns a simple string representation of the status.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Writing => "writing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Capability interface of a platform container writer.
///
/// Calls are made from a single serial context; only the finish callback
/// may run on another thread.
pub trait ContainerWriter: Send {
    /// Destination of the container.
    fn output_path(&self) -> &Path;

    /// Current writer status.
    fn status(&self) -> WriterStatus;

    /// Description of the fault that moved the writer to `Failed`.
    fn last_error(&self) -> Option<String>;

    /// Check whether a track with this configuration can be carried.
    fn can_add(&self, config: &TrackConfig) -> bool;

    /// Register a track. Only valid before [`start_writing`](Self::start_writing).
    fn add_track(&mut self, kind: TrackKind, config: TrackConfig) -> WriterResult<()>;

    /// Begin accepting samples.
    fn start_writing(&mut self) -> WriterResult<()>;

    /// Check whether the track can take another sample right now.
    fn is_ready(&self, kind: TrackKind) -> bool;

    /// Append one sample. `Ok(false)` means the sample was not taken.
    fn append(&mut self, kind: TrackKind, sample: TimedSample) -> WriterResult<bool>;

    /// Mark a track as complete; later appends to it are refused.
    fn mark_finished(&mut self, kind: TrackKind);

    /// Finalize the container asynchronously and report through `on_complete`.
    fn finish_writing(&mut self, on_complete: FinishCallback);

    /// Abandon the container without finalizing it.
    fn cancel(&mut self);
}
