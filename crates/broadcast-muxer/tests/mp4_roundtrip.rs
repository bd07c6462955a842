//! End-to-end: multiplexer into a real MP4 file, read back.

use std::path::Path;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use broadcast_ipc::{ContainerStatus, SampleBuffer, TrackKind};
use broadcast_muxer::{Multiplexer, MuxerConfig};
use broadcast_writer::{inspect_container, ContainerSummary, Mp4FileWriter, TrackMedia};

const MS: u64 = 10_000;

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
    SampleBuffer::new(ms * MS, Bytes::from_static(&[0x21, 0x10, 0x04, 0x60, 0x8C]))
}

fn video(index: u64, ms: u64) -> SampleBuffer {
    if index == 0 {
        keyframe(ms)
    } else {
        delta(ms)
    }
}

fn open(path: &Path) -> Multiplexer {
    let config = MuxerConfig {
        screen: broadcast_ipc::ScreenGeometry::new(640.0, 360.0, 1.0),
        ..Default::default()
    };
    let writer = Mp4FileWriter::new(path).unwrap();
    let muxer = Multiplexer::new(Box::new(writer), config).unwrap();
    muxer.start().unwrap();
    muxer
}

/// Offer a buffer until the track input has room for it.
fn feed(muxer: &Multiplexer, buffer: SampleBuffer, kind: TrackKind) {
    for _ in 0..2000 {
        if muxer.process_buffer(&buffer, kind).unwrap() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("{} track never accepted buffer", kind.name());
}

fn record(path: &Path, video_count: u64, app_count: u64, mic_count: u64) -> ContainerSummary {
    let muxer = open(path);
    let total = video_count.max(app_count).max(mic_count);
    for i in 0..total {
        if i < video_count {
            feed(&muxer, video(i, i * 33), TrackKind::Video);
        }
        if i < app_count {
            feed(&muxer, audio(i * 23), TrackKind::AppAudio);
        }
        if i < mic_count {
            feed(&muxer, audio(5 + i * 23), TrackKind::MicAudio);
        }
    }
    let output = muxer.finish().unwrap();
    assert_eq!(output, path);
    assert_eq!(muxer.status(), ContainerStatus::Completed);

    inspect_container(&output).unwrap()
}

#[test]
fn test_round_trip_all_tracks() {
    let dir = tempfile::tempdir().unwrap();
    let summary = record(&dir.path().join("all.mp4"), 12, 8, 5);

    assert_eq!(summary.count(TrackMedia::Video), 1);
    assert_eq!(summary.count(TrackMedia::Audio), 2);

    let counts: Vec<u32> = summary.tracks.iter().map(|t| t.sample_count).collect();
    let mut audio_counts: Vec<u32> = summary
        .tracks
        .iter()
        .filter(|t| t.media == TrackMedia::Audio)
        .map(|t| t.sample_count)
        .collect();
    audio_counts.sort_unstable();

    assert_eq!(counts.iter().sum::<u32>(), 25);
    assert_eq!(summary.track(TrackMedia::Video).unwrap().sample_count, 12);
    assert_eq!(audio_counts, vec![5, 8]);
}

#[test]
fn test_round_trip_without_microphone() {
    let dir = tempfile::tempdir().unwrap();
    let summary = record(&dir.path().join("nomic.mp4"), 10, 6, 0);

    assert_eq!(summary.tracks.len(), 2);
    assert_eq!(summary.track(TrackMedia::Video).unwrap().sample_count, 10);
    assert_eq!(summary.track(TrackMedia::Audio).unwrap().sample_count, 6);
}

#[test]
fn test_video_only_duration() {
    let dir = tempfile::tempdir().unwrap();
    let summary = record(&dir.path().join("video.mp4"), 100, 0, 0);

    assert_eq!(summary.tracks.len(), 1);
    let video = summary.track(TrackMedia::Video).unwrap();
    assert_eq!(video.sample_count, 100);
    assert_eq!(video.duration, Duration::from_millis(3300));
}

#[test]
fn test_tracks_are_relative_to_first_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anchored.mp4");

    let muxer = open(&path);
    for i in 0..50 {
        feed(&muxer, audio(500 + i * 20), TrackKind::AppAudio);
        feed(&muxer, video(i, 510 + i * 33), TrackKind::Video);
    }
    assert_eq!(muxer.anchor(), Some(500 * MS));
    muxer.finish().unwrap();

    let summary = inspect_container(&path).unwrap();
    let audio = summary.track(TrackMedia::Audio).unwrap();
    let video = summary.track(TrackMedia::Video).unwrap();
    assert_eq!(audio.sample_count, 50);
    assert_eq!(video.sample_count, 50);
    assert_eq!(audio.first_presentation, Duration::ZERO);
    assert_eq!(video.first_presentation, Duration::from_millis(10));
}

#[test]
fn test_dropping_unfinished_muxer_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropped.mp4");

    let muxer = open(&path);
    feed(&muxer, keyframe(0), TrackKind::Video);
    drop(muxer);

    assert!(!path.exists());
}
