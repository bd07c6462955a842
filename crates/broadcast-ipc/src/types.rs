//! Common types used across the recorder crates.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Presentation timestamps are carried in 100ns units.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// The media streams a broadcast session delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackKind {
    /// Screen video.
    Video,

    /// System (application) audio.
    AppAudio,

    /// Microphone audio.
    MicAudio,
}

impl TrackKind {
    /// Every track kind, in registration order.
    pub const ALL: [TrackKind; 3] = [Self::Video, Self::AppAudio, Self::MicAudio];

    /// Returns true for the two audio kinds.
    pub fn is_audio(self) -> bool {
        matches!(self, Self::AppAudio | Self::MicAudio)
    }

    /// Returns a short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::AppAudio => "app-audio",
            Self::MicAudio => "mic-audio",
        }
    }
}

/// A timestamped sample delivered by the host broadcast session.
///
/// The payload is already encoded by the platform: an H.264 Annex B access
/// unit for video, one raw AAC frame for audio.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    /// Presentation timestamp in 100ns units on the host clock.
    pub pts_100ns: u64,

    /// Whether the host considers the buffer valid.
    pub is_valid: bool,

    /// Whether the buffer's data is ready to be read.
    pub data_ready: bool,

    /// Whether this sample can be decoded on its own.
    pub is_keyframe: bool,

    /// Encoded payload.
    pub data: Bytes,
}

impl SampleBuffer {
    /// Create a valid, ready, non-key sample.
    pub fn new(pts_100ns: u64, data: Bytes) -> Self {
        Self {
            pts_100ns,
            is_valid: true,
            data_ready: true,
            is_keyframe: false,
            data,
        }
    }

    /// Set the keyframe flag.
    pub fn with_keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    /// Set the data-ready flag.
    pub fn with_data_ready(mut self, data_ready: bool) -> Self {
        self.data_ready = data_ready;
        self
    }

    /// Set the validity flag.
    pub fn with_valid(mut self, is_valid: bool) -> Self {
        self.is_valid = is_valid;
        self
    }

    /// Returns true if the buffer may be processed at all.
    pub fn is_usable(&self) -> bool {
        self.is_valid && self.data_ready
    }

    /// Get the presentation timestamp in milliseconds.
    pub fn pts_ms(&self) -> u64 {
        self.pts_100ns / 10_000
    }
}

/// Logical size of the captured display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenGeometry {
    /// Width in points.
    pub width: f64,

    /// Height in points.
    pub height: f64,

    /// Points-to-pixels scale factor.
    pub scale: f64,
}

impl ScreenGeometry {
    /// Create a new geometry.
    pub fn new(width: f64, height: f64, scale: f64) -> Self {
        Self {
            width,
            height,
            scale,
        }
    }

    /// Pixel dimensions, rounded down to even numbers for the encoder.
    pub fn pixel_dimensions(&self) -> (u32, u32) {
        let even = |points: f64| {
            let pixels = (points * self.scale).max(0.0) as u32;
            (pixels / 2) * 2
        };
        (even(self.width), even(self.height))
    }
}

impl Default for ScreenGeometry {
    fn default() -> Self {
        Self::new(1920.0, 1080.0, 1.0)
    }
}

/// Setup information handed over by the host when a broadcast starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupInfo {
    /// Geometry of the display being broadcast.
    pub screen: ScreenGeometry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_dimensions_round_to_even() {
        let screen = ScreenGeometry::new(390.0, 844.0, 3.0);
        assert_eq!(screen.pixel_dimensions(), (1170, 2532));

        let odd = ScreenGeometry::new(375.5, 667.0, 1.0);
        assert_eq!(odd.pixel_dimensions(), (374, 666));
    }

    #[test]
    fn test_sample_buffer_usability() {
        let buffer = SampleBuffer::new(0, Bytes::from_static(&[1, 2, 3]));
        assert!(buffer.is_usable());
        assert!(!buffer.clone().with_data_ready(false).is_usable());
        assert!(!buffer.with_valid(false).is_usable());
    }
}
