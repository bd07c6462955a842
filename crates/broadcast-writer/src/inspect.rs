//! Read back the track layout of a finished container.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use mp4::{Mp4Reader, TrackType};
use serde::Serialize;
use tracing::debug;

use crate::WriterResult;

/// Media kind of a track found in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackMedia {
    Video,
    Audio,
    Other,
}

/// One track of a finished container.
#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub track_id: u32,
    pub media: TrackMedia,
    pub sample_count: u32,
    pub timescale: u32,

    /// Presentation time of the first sample on the movie timeline.
    pub first_presentation: Duration,

    pub duration: Duration,
}

/// Track layout of a finished container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub duration: Duration,
    pub tracks: Vec<TrackSummary>,
}

impl ContainerSummary {
    /// First track of the given media kind.
    pub fn track(&self, media: TrackMedia) -> Option<&TrackSummary> {
        self.tracks.iter().find(|t| t.media == media)
    }

    /// Number of tracks of the given media kind.
    pub fn count(&self, media: TrackMedia) -> usize {
        self.tracks.iter().filter(|t| t.media == media).count()
    }
}

/// Parse a container's header and summarize its tracks in track id order.
pub fn inspect_container(path: &Path) -> WriterResult<ContainerSummary> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut reader = Mp4Reader::read_header(BufReader::new(file), size)?;

    let mut track_ids: Vec<u32> = reader.tracks().keys().copied().collect();
    track_ids.sort_unstable();

    let mut tracks = Vec::with_capacity(track_ids.len());
    for track_id in track_ids {
        let Some(track) = reader.tracks().get(&track_id) else {
            continue;
        };
        let media = match track.track_type()? {
            TrackType::Video => TrackMedia::Video,
            TrackType::Audio => TrackMedia::Audio,
            _ => TrackMedia::Other,
        };
        let sample_count = track.sample_count();
        let timescale = track.timescale();
        let duration = track.duration();

        let first_presentation = if sample_count == 0 {
            Duration::ZERO
        } else {
            match reader.read_sample(track_id, 1)? {
                Some(sample) => ticks_to_duration(
                    sample.start_time as i64 + sample.rendering_offset as i64,
                    timescale,
                ),
                None => Duration::ZERO,
            }
        };

        debug!(track_id, ?media, sample_count, ?first_presentation, "Inspected track");
        tracks.push(TrackSummary {
            track_id,
            media,
            sample_count,
            timescale,
            first_presentation,
            duration,
        });
    }

    Ok(ContainerSummary {
        duration: reader.duration(),
        tracks,
    })
}

fn ticks_to_duration(ticks: i64, timescale: u32) -> Duration {
    if ticks <= 0 || timescale == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((ticks as u128 * 1_000_000_000 / timescale as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_to_duration() {
        assert_eq!(ticks_to_duration(480, 48000), Duration::from_millis(10));
        assert_eq!(ticks_to_duration(90_000, 90_000), Duration::from_secs(1));
        assert_eq!(ticks_to_duration(-5, 1000), Duration::ZERO);
    }

    #[test]
    fn test_inspect_rejects_non_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.mp4");
        std::fs::write(&path, b"definitely not a movie").unwrap();

        assert!(inspect_container(&path).is_err());
    }

    #[test]
    fn test_inspect_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect_container(&dir.path().join("absent.mp4")).is_err());
    }
}
