//! Track selection and the per-session track table.

use tracing::{debug, warn};

use broadcast_ipc::TrackKind;
use broadcast_writer::{TrackConfig, VideoCodec};

use crate::MuxerConfig;

/// Video codecs in order of preference.
const VIDEO_CODEC_PREFERENCE: [VideoCodec; 2] = [VideoCodec::Hevc, VideoCodec::H264];

/// Choose a configuration for every track the writer can carry.
///
/// Video takes the first codec the writer accepts. Tracks with no supported
/// configuration are left out.
pub(crate) fn plan_tracks(
    config: &MuxerConfig,
    can_add: impl Fn(&TrackConfig) -> bool,
) -> Vec<(TrackKind, TrackConfig)> {
    let mut plan = Vec::with_capacity(TrackKind::ALL.len());

    let video = VIDEO_CODEC_PREFERENCE
        .iter()
        .map(|codec| config.video_track(*codec))
        .find(|candidate| can_add(candidate));
    match video {
        Some(video) => plan.push((TrackKind::Video, video)),
        None => warn!("No supported video configuration, recording without video"),
    }

    for kind in TrackKind::ALL.into_iter().filter(|kind| kind.is_audio()) {
        let audio = config.audio_track();
        if can_add(&audio) {
            plan.push((kind, audio));
        } else {
            warn!(track = kind.name(), "Audio configuration not supported");
        }
    }

    plan
}

struct TrackEntry {
    kind: TrackKind,
    finished: bool,
}

/// Tracks registered with the writer for one session.
#[derive(Default)]
pub(crate) struct TrackTable {
    entries: Vec<TrackEntry>,
}

impl TrackTable {
    pub(crate) fn register(&mut self, kind: TrackKind) {
        if !self.contains(kind) {
            self.entries.push(TrackEntry {
                kind,
                finished: false,
            });
        }
    }

    pub(crate) fn contains(&self, kind: TrackKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Flag every unfinished track and return the ones flagged now.
    pub(crate) fn finish_all(&mut self) -> Vec<TrackKind> {
        let mut newly_finished = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| !e.finished) {
            entry.finished = true;
            debug!(track = entry.kind.name(), "Track finished");
            newly_finished.push(entry.kind);
        }
        newly_finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broadcast_ipc::ScreenGeometry;

    #[test]
    fn test_plan_prefers_hevc() {
        let plan = plan_tracks(&MuxerConfig::default(), |_| true);
        assert_eq!(plan.len(), 3);
        assert!(matches!(
            &plan[0],
            (TrackKind::Video, TrackConfig::Video(v)) if v.codec == VideoCodec::Hevc
        ));
    }

    #[test]
    fn test_plan_falls_back_to_h264() {
        let config = MuxerConfig {
            screen: ScreenGeometry::new(390.0, 844.0, 3.0),
            ..Default::default()
        };
        let plan = plan_tracks(&config, |c| {
            !matches!(c, TrackConfig::Video(v) if v.codec == VideoCodec::Hevc)
        });

        match &plan[0] {
            (TrackKind::Video, TrackConfig::Video(v)) => {
                assert_eq!(v.codec, VideoCodec::H264);
                assert_eq!((v.width, v.height), (1170, 2532));
                assert_eq!(v.expected_fps, 60);
            }
            other => panic!("unexpected first track {:?}", other),
        }
    }

    #[test]
    fn test_plan_skips_unsupported_audio() {
        let plan = plan_tracks(&MuxerConfig::default(), |c| {
            matches!(c, TrackConfig::Video(_))
        });
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].0, TrackKind::Video);
    }

    #[test]
    fn test_finish_all_marks_once() {
        let mut table = TrackTable::default();
        table.register(TrackKind::Video);
        table.register(TrackKind::MicAudio);
        table.register(TrackKind::Video);
        assert_eq!(table.len(), 2);

        assert_eq!(
            table.finish_all(),
            vec![TrackKind::Video, TrackKind::MicAudio]
        );
        assert!(table.finish_all().is_empty());
    }
}
