//! MP4 file writer driven by a mux worker thread.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use mp4::{
    AacConfig, AudioObjectType, AvcConfig, ChannelConfig, MediaConfig, Mp4Config, Mp4Sample,
    Mp4Writer, SampleFreqIndex, TrackType,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use broadcast_ipc::{TrackKind, TICKS_PER_SECOND};

use crate::error::WriterError;
use crate::nal::{annex_b_to_sample, find_parameter_sets, parse_annex_b, ParameterSets};
use crate::{
    ContainerWriter, FinishCallback, TimedSample, TrackConfig, VideoCodec, WriterResult,
    WriterStatus, TRACK_QUEUE_CAPACITY,
};

/// Movie-level timescale.
const MOVIE_TIMESCALE: u32 = 1000;

/// Video track timescale.
const VIDEO_TIMESCALE: u32 = 90_000;

/// Samples per AAC-LC frame.
const AAC_FRAME_SAMPLES: u32 = 1024;

type FileMuxer = Mp4Writer<BufWriter<File>>;

/// Status shared between the writer handle and its mux worker.
struct WriterShared {
    status: RwLock<WriterStatus>,
    error: Mutex<Option<String>>,
}

impl WriterShared {
    fn new() -> Self {
        Self {
            status: RwLock::new(WriterStatus::Unknown),
            error: Mutex::new(None),
        }
    }

    fn status(&self) -> WriterStatus {
        *self.status.read()
    }

    fn set_status(&self, status: WriterStatus) {
        *self.status.write() = status;
    }

    fn last_error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn fail(&self, message: String) {
        error!(%message, "MP4 writer failed");
        *self.error.lock() = Some(message);
        self.set_status(WriterStatus::Failed);
    }
}

/// Per-track input state on the caller side.
struct TrackInput {
    config: TrackConfig,
    in_flight: Arc<AtomicUsize>,
    finished: bool,
    described: bool,
    /// Presentation time of the last sample handed to the worker.
    last_pts: Option<u64>,
}

enum MuxJob {
    Sample {
        kind: TrackKind,
        sample: TimedSample,
        parameter_sets: Option<ParameterSets>,
    },
    Finish(FinishCallback),
}

/// Writes H.264 and AAC samples into an MP4 file.
///
/// Appends only enqueue; a worker thread converts and writes the samples.
/// Each track has its own bounded queue, and a track whose queue is full
/// reports that it is not ready. Tracks appear in the file once their first
/// sample is written, so a registered track that never receives a sample is
/// left out of the container.
pub struct Mp4FileWriter {
    path: PathBuf,
    queue_capacity: usize,
    file: Option<File>,
    tracks: HashMap<TrackKind, TrackInput>,
    shared: Arc<WriterShared>,
    job_tx: Option<Sender<MuxJob>>,
    worker: Option<JoinHandle<()>>,
    finishing: bool,
}

impl Mp4FileWriter {
    /// Create a writer for a file that must not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> WriterResult<Self> {
        Self::with_queue_capacity(path, TRACK_QUEUE_CAPACITY)
    }

    /// Create a writer with a custom per-track queue depth.
    #[instrument(name = "mp4_writer_new", skip_all)]
    pub fn with_queue_capacity(path: impl Into<PathBuf>, queue_capacity: usize) -> WriterResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => WriterError::OutputExists(path.clone()),
                _ => WriterError::Io(e),
            })?;

        debug!(path = %path.display(), queue_capacity, "Created MP4 writer");

        Ok(Self {
            path,
            queue_capacity: queue_capacity.max(1),
            file: Some(file),
            tracks: HashMap::new(),
            shared: Arc::new(WriterShared::new()),
            job_tx: None,
            worker: None,
            finishing: false,
        })
    }

    fn stop_worker(&mut self) {
        self.job_tx = None;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl ContainerWriter for Mp4FileWriter {
    fn output_path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> WriterStatus {
        self.shared.status()
    }

    fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    fn can_add(&self, config: &TrackConfig) -> bool {
        check_track(config).is_ok()
    }

    fn add_track(&mut self, kind: TrackKind, config: TrackConfig) -> WriterResult<()> {
        let status = self.shared.status();
        if status != WriterStatus::Unknown {
            return Err(WriterError::WrongStatus(status));
        }
        check_track(&config).map_err(|reason| WriterError::UnsupportedTrack { kind, reason })?;

        debug!(track = kind.name(), ?config, "Registered track");
        self.tracks.insert(
            kind,
            TrackInput {
                config,
                in_flight: Arc::new(AtomicUsize::new(0)),
                finished: false,
                described: false,
                last_pts: None,
            },
        );
        Ok(())
    }

    #[instrument(name = "mp4_start_writing", skip(self))]
    fn start_writing(&mut self) -> WriterResult<()> {
        let status = self.shared.status();
        if status != WriterStatus::Unknown {
            return Err(WriterError::WrongStatus(status));
        }
        let file = self.file.take().ok_or(WriterError::WrongStatus(status))?;

        let config = Mp4Config {
            major_brand: str::parse("isom")?,
            minor_version: 512,
            compatible_brands: vec![
                str::parse("isom")?,
                str::parse("iso2")?,
                str::parse("avc1")?,
                str::parse("mp41")?,
            ],
            timescale: MOVIE_TIMESCALE,
        };
        let muxer = Mp4Writer::write_start(BufWriter::new(file), &config)?;

        let (job_tx, job_rx) =
            crossbeam_channel::bounded(self.queue_capacity * TrackKind::ALL.len() + 1);

        let worker = MuxWorker {
            muxer,
            configs: self
                .tracks
                .iter()
                .map(|(kind, track)| (*kind, track.config.clone()))
                .collect(),
            in_flight: self
                .tracks
                .iter()
                .map(|(kind, track)| (*kind, Arc::clone(&track.in_flight)))
                .collect(),
            timelines: HashMap::new(),
            next_track_id: 1,
            shared: Arc::clone(&self.shared),
        };

        let handle = thread::Builder::new()
            .name("mp4-mux".to_string())
            .spawn(move || worker.run(job_rx))?;

        self.job_tx = Some(job_tx);
        self.worker = Some(handle);
        self.shared.set_status(WriterStatus::Writing);

        info!(path = %self.path.display(), tracks = self.tracks.len(), "MP4 writing started");
        Ok(())
    }

    fn is_ready(&self, kind: TrackKind) -> bool {
        if self.finishing || self.shared.status() != WriterStatus::Writing {
            return false;
        }
        self.tracks.get(&kind).is_some_and(|track| {
            !track.finished && track.in_flight.load(Ordering::Acquire) < self.queue_capacity
        })
    }

    fn append(&mut self, kind: TrackKind, sample: TimedSample) -> WriterResult<bool> {
        match self.shared.status() {
            WriterStatus::Writing => {}
            WriterStatus::Failed => {
                return Err(WriterError::Failed(
                    self.shared.last_error().unwrap_or_default(),
                ))
            }
            other => return Err(WriterError::WrongStatus(other)),
        }

        let track = self
            .tracks
            .get_mut(&kind)
            .ok_or(WriterError::UnknownTrack(kind))?;
        if track.finished || self.finishing {
            return Ok(false);
        }
        if track.in_flight.load(Ordering::Acquire) >= self.queue_capacity {
            return Ok(false);
        }

        // Durations come from successive timestamps; a sample that does not
        // move forward would shift every later sample of the track.
        let pts = sample.pts_100ns;
        if track.last_pts.is_some_and(|last| pts <= last) {
            debug!(
                track = kind.name(),
                pts_ms = pts / 10_000,
                "Dropping sample that does not advance the track"
            );
            return Ok(false);
        }

        // The video track can only be described once SPS/PPS have been seen.
        let parameter_sets = match track.config {
            TrackConfig::Video(_) if !track.described => {
                match find_parameter_sets(&parse_annex_b(&sample.data)).filter(|s| s.is_usable()) {
                    Some(sets) => Some(sets),
                    None => {
                        debug!("Video sample dropped while waiting for parameter sets");
                        return Ok(false);
                    }
                }
            }
            _ => None,
        };
        let describes_track = parameter_sets.is_some();

        let Some(job_tx) = self.job_tx.as_ref() else {
            return Err(WriterError::WorkerUnavailable);
        };

        track.in_flight.fetch_add(1, Ordering::AcqRel);
        match job_tx.try_send(MuxJob::Sample {
            kind,
            sample,
            parameter_sets,
        }) {
            Ok(()) => {
                if describes_track {
                    track.described = true;
                }
                track.last_pts = Some(pts);
                Ok(true)
            }
            Err(TrySendError::Full(_)) => {
                track.in_flight.fetch_sub(1, Ordering::AcqRel);
                trace!(track = kind.name(), "Mux queue full");
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => {
                track.in_flight.fetch_sub(1, Ordering::AcqRel);
                Err(WriterError::WorkerUnavailable)
            }
        }
    }

    fn mark_finished(&mut self, kind: TrackKind) {
        if let Some(track) = self.tracks.get_mut(&kind) {
            if !track.finished {
                track.finished = true;
                debug!(track = kind.name(), "Track marked finished");
            }
        }
    }

    #[instrument(name = "mp4_finish_writing", skip_all)]
    fn finish_writing(&mut self, on_complete: FinishCallback) {
        let status = self.shared.status();
        if self.finishing || status != WriterStatus::Writing {
            let err = match status {
                WriterStatus::Failed => {
                    WriterError::Failed(self.shared.last_error().unwrap_or_default())
                }
                other => WriterError::WrongStatus(other),
            };
            on_complete(Err(err));
            return;
        }

        let Some(job_tx) = self.job_tx.take() else {
            on_complete(Err(WriterError::WorkerUnavailable));
            return;
        };
        self.finishing = true;

        // Queued samples are written before the finish job; the worker exits after it.
        if let Err(err) = job_tx.send(MuxJob::Finish(on_complete)) {
            if let MuxJob::Finish(on_complete) = err.into_inner() {
                on_complete(Err(WriterError::WorkerUnavailable));
            }
        }
    }

    #[instrument(name = "mp4_cancel", skip(self))]
    fn cancel(&mut self) {
        if self.finishing {
            return;
        }
        match self.shared.status() {
            WriterStatus::Unknown | WriterStatus::Writing => {}
            _ => return,
        }

        self.stop_worker();
        self.file = None;
        self.shared.set_status(WriterStatus::Cancelled);

        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Discarded partial container"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial container: {}", e),
        }
    }
}

impl Drop for Mp4FileWriter {
    fn drop(&mut self) {
        // A pending finish owns the worker; let it complete on its own.
        if self.finishing {
            return;
        }
        match self.shared.status() {
            WriterStatus::Unknown | WriterStatus::Writing => self.cancel(),
            _ => self.stop_worker(),
        }
    }
}

/// Check whether a track configuration can be described in an MP4 file.
fn check_track(config: &TrackConfig) -> Result<(), String> {
    match config {
        TrackConfig::Video(video) => {
            if video.codec != VideoCodec::H264 {
                return Err(format!("{:?} samples cannot be described", video.codec));
            }
            if video.width == 0 || video.height == 0 {
                return Err("empty frame size".to_string());
            }
            if video.width % 2 != 0 || video.height % 2 != 0 {
                return Err(format!("odd frame size {}x{}", video.width, video.height));
            }
            if video.width > u16::MAX as u32 || video.height > u16::MAX as u32 {
                return Err(format!("frame size {}x{} too large", video.width, video.height));
            }
            Ok(())
        }
        TrackConfig::Audio(audio) => {
            freq_index(audio.sample_rate)
                .ok_or_else(|| format!("sample rate {} Hz", audio.sample_rate))?;
            channel_config(audio.channels)
                .ok_or_else(|| format!("{} channels", audio.channels))?;
            Ok(())
        }
    }
}

fn freq_index(sample_rate: u32) -> Option<SampleFreqIndex> {
    let index = match sample_rate {
        96000 => SampleFreqIndex::Freq96000,
        88200 => SampleFreqIndex::Freq88200,
        64000 => SampleFreqIndex::Freq64000,
        48000 => SampleFreqIndex::Freq48000,
        44100 => SampleFreqIndex::Freq44100,
        32000 => SampleFreqIndex::Freq32000,
        24000 => SampleFreqIndex::Freq24000,
        22050 => SampleFreqIndex::Freq22050,
        16000 => SampleFreqIndex::Freq16000,
        12000 => SampleFreqIndex::Freq12000,
        11025 => SampleFreqIndex::Freq11025,
        8000 => SampleFreqIndex::Freq8000,
        7350 => SampleFreqIndex::Freq7350,
        _ => return None,
    };
    Some(index)
}

fn channel_config(channels: u16) -> Option<ChannelConfig> {
    match channels {
        1 => Some(ChannelConfig::Mono),
        2 => Some(ChannelConfig::Stereo),
        _ => None,
    }
}

/// Convert a 100ns timestamp to track timescale ticks.
fn to_ticks(pts_100ns: u64, timescale: u32) -> u64 {
    (pts_100ns as u128 * timescale as u128 / TICKS_PER_SECOND as u128) as u64
}

/// A sample held back until the next one fixes its duration.
struct PendingSample {
    ticks: u64,
    is_sync: bool,
    bytes: Bytes,
}

/// Timing state of a track that exists in the file.
struct TrackTimeline {
    track_id: u32,
    timescale: u32,
    first_ticks: u64,
    /// Constant composition offset placing the first sample at its distance
    /// from the session anchor.
    composition_offset: i32,
    default_duration: u32,
    last_duration: Option<u32>,
    pending: Option<PendingSample>,
    written: u64,
}

struct MuxWorker {
    muxer: FileMuxer,
    configs: HashMap<TrackKind, TrackConfig>,
    in_flight: HashMap<TrackKind, Arc<AtomicUsize>>,
    timelines: HashMap<TrackKind, TrackTimeline>,
    next_track_id: u32,
    shared: Arc<WriterShared>,
}

impl MuxWorker {
    fn run(mut self, jobs: Receiver<MuxJob>) {
        debug!("Mux worker started");

        while let Ok(job) = jobs.recv() {
            match job {
                MuxJob::Sample {
                    kind,
                    sample,
                    parameter_sets,
                } => {
                    if self.shared.status() == WriterStatus::Writing {
                        if let Err(e) = self.write(kind, sample, parameter_sets) {
                            self.shared.fail(format!("{} track: {}", kind.name(), e));
                        }
                    }
                    if let Some(in_flight) = self.in_flight.get(&kind) {
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                MuxJob::Finish(on_complete) => {
                    let shared = Arc::clone(&self.shared);
                    let result = match shared.status() {
                        WriterStatus::Failed => Err(WriterError::Failed(
                            shared.last_error().unwrap_or_default(),
                        )),
                        _ => self.finish(),
                    };
                    match &result {
                        Ok(()) => shared.set_status(WriterStatus::Completed),
                        Err(e) if shared.status() != WriterStatus::Failed => {
                            shared.fail(e.to_string())
                        }
                        Err(_) => {}
                    }
                    on_complete(result);
                    return;
                }
            }
        }

        debug!("Job channel closed, abandoning container");
    }

    fn write(
        &mut self,
        kind: TrackKind,
        sample: TimedSample,
        parameter_sets: Option<ParameterSets>,
    ) -> WriterResult<()> {
        let config = self
            .configs
            .get(&kind)
            .cloned()
            .ok_or(WriterError::UnknownTrack(kind))?;

        let (bytes, is_sync) = match config {
            TrackConfig::Video(_) => {
                let payload = annex_b_to_sample(&sample.data);
                (payload.data, sample.is_keyframe || payload.contains_idr)
            }
            TrackConfig::Audio(_) => (sample.data, true),
        };

        if !self.timelines.contains_key(&kind) {
            let timeline =
                self.materialize(kind, &config, parameter_sets.as_ref(), sample.pts_100ns)?;
            self.timelines.insert(kind, timeline);
        }
        let timeline = self
            .timelines
            .get_mut(&kind)
            .ok_or(WriterError::UnknownTrack(kind))?;

        let ticks = to_ticks(sample.pts_100ns, timeline.timescale);
        if let Some(previous) = timeline.pending.take() {
            let duration = ticks.saturating_sub(previous.ticks).clamp(1, u32::MAX as u64) as u32;
            timeline.last_duration = Some(duration);
            write_sample(&mut self.muxer, timeline, previous, duration)?;
        }
        timeline.pending = Some(PendingSample {
            ticks,
            is_sync,
            bytes,
        });
        Ok(())
    }

    /// Add the track to the file, using its first sample's timing.
    fn materialize(
        &mut self,
        kind: TrackKind,
        config: &TrackConfig,
        parameter_sets: Option<&ParameterSets>,
        first_pts_100ns: u64,
    ) -> WriterResult<TrackTimeline> {
        let (track_type, timescale, media_conf, default_duration) = match config {
            TrackConfig::Video(video) => {
                let sets = parameter_sets.ok_or_else(|| WriterError::UnsupportedTrack {
                    kind,
                    reason: "first video sample carried no parameter sets".to_string(),
                })?;
                let media_conf = MediaConfig::AvcConfig(AvcConfig {
                    width: video.width as u16,
                    height: video.height as u16,
                    seq_param_set: sets.sps.to_vec(),
                    pic_param_set: sets.pps.to_vec(),
                });
                (
                    TrackType::Video,
                    VIDEO_TIMESCALE,
                    media_conf,
                    VIDEO_TIMESCALE / video.expected_fps.max(1),
                )
            }
            TrackConfig::Audio(audio) => {
                let unsupported = |reason: String| WriterError::UnsupportedTrack { kind, reason };
                let media_conf = MediaConfig::AacConfig(AacConfig {
                    bitrate: audio.bitrate_kbps * 1000,
                    profile: AudioObjectType::AacLowComplexity,
                    freq_index: freq_index(audio.sample_rate)
                        .ok_or_else(|| unsupported(format!("sample rate {}", audio.sample_rate)))?,
                    chan_conf: channel_config(audio.channels)
                        .ok_or_else(|| unsupported(format!("{} channels", audio.channels)))?,
                });
                (
                    TrackType::Audio,
                    audio.sample_rate,
                    media_conf,
                    AAC_FRAME_SAMPLES,
                )
            }
        };

        self.muxer.add_track(&mp4::TrackConfig {
            track_type,
            timescale,
            language: String::from("und"),
            media_conf,
        })?;
        let track_id = self.next_track_id;
        self.next_track_id += 1;

        let first_ticks = to_ticks(first_pts_100ns, timescale);
        let composition_offset = i32::try_from(first_ticks).map_err(|_| {
            WriterError::Container(format!(
                "{} track starts {} ticks after the anchor",
                kind.name(),
                first_ticks
            ))
        })?;

        info!(
            track = kind.name(),
            track_id,
            timescale,
            offset_ticks = first_ticks,
            "Track added to container"
        );

        Ok(TrackTimeline {
            track_id,
            timescale,
            first_ticks,
            composition_offset,
            default_duration,
            last_duration: None,
            pending: None,
            written: 0,
        })
    }

    /// Flush held samples, write the movie box and flush the file.
    fn finish(mut self) -> WriterResult<()> {
        for (kind, timeline) in self.timelines.iter_mut() {
            if let Some(last) = timeline.pending.take() {
                let duration = timeline.last_duration.unwrap_or(timeline.default_duration);
                write_sample(&mut self.muxer, timeline, last, duration)?;
            }
            info!(track = kind.name(), samples = timeline.written, "Track complete");
        }

        self.muxer.write_end()?;
        let mut file = self.muxer.into_writer();
        file.flush()?;
        Ok(())
    }
}

fn write_sample(
    muxer: &mut FileMuxer,
    timeline: &mut TrackTimeline,
    sample: PendingSample,
    duration: u32,
) -> WriterResult<()> {
    let start_time = sample.ticks.saturating_sub(timeline.first_ticks);
    trace!(
        track_id = timeline.track_id,
        start_time,
        duration,
        size = sample.bytes.len(),
        "Writing sample"
    );

    muxer.write_sample(
        timeline.track_id,
        &Mp4Sample {
            start_time,
            duration,
            rendering_offset: timeline.composition_offset,
            is_sync: sample.is_sync,
            bytes: sample.bytes,
        },
    )?;
    timeline.written += 1;
    Ok(())
}
