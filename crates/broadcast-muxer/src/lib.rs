//! Time-anchored multi-track multiplexer for broadcast sessions.
//!
//! A [`Multiplexer`] owns one container writer and the three track inputs of
//! a broadcast (video, app audio, microphone audio). Every operation runs on
//! the multiplexer's own serial context, so appends never race and the
//! session time anchor is set exactly once.

mod error;
pub mod memory;
mod metrics;
mod multiplexer;
mod tracks;

pub use error::{MuxerError, MuxerResult};
pub use metrics::{MetricsSnapshot, MuxMetrics, TrackMetrics};
pub use multiplexer::Multiplexer;

use std::time::Duration;

use broadcast_ipc::ScreenGeometry;
use broadcast_writer::{AudioTrackConfig, TrackConfig, VideoCodec, VideoTrackConfig};

/// Default bound on the wait for container finalization.
pub const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Track and timing parameters of one multiplexer session.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxerConfig {
    /// Display being recorded; sets the video dimensions.
    pub screen: ScreenGeometry,

    /// Expected source frame rate.
    pub expected_fps: u32,

    /// Audio sample rate in Hz (app audio and microphone).
    pub audio_sample_rate: u32,

    /// Audio channel count.
    pub audio_channels: u16,

    /// AAC bitrate in kbps.
    pub audio_bitrate_kbps: u32,

    /// Bound on the finish wait. `None` waits indefinitely.
    pub finish_timeout: Option<Duration>,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            screen: ScreenGeometry::default(),
            expected_fps: 60,
            audio_sample_rate: 44100,
            audio_channels: 1,
            audio_bitrate_kbps: 128,
            finish_timeout: Some(DEFAULT_FINISH_TIMEOUT),
        }
    }
}

impl MuxerConfig {
    /// Video track configuration for the given codec.
    pub fn video_track(&self, codec: VideoCodec) -> TrackConfig {
        let (width, height) = self.screen.pixel_dimensions();
        TrackConfig::Video(VideoTrackConfig {
            width,
            height,
            codec,
            expected_fps: self.expected_fps,
        })
    }

    /// Audio track configuration, shared by app audio and microphone.
    pub fn audio_track(&self) -> TrackConfig {
        TrackConfig::Audio(AudioTrackConfig {
            sample_rate: self.audio_sample_rate,
            channels: self.audio_channels,
            bitrate_kbps: self.audio_bitrate_kbps,
        })
    }
}
