//! The multiplexer and its serial command context.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, trace, warn};

use broadcast_ipc::{ContainerStatus, SampleBuffer, TrackKind};
use broadcast_writer::{ContainerWriter, TimedSample, WriterError, WriterResult, WriterStatus};

use crate::error::{MuxerError, MuxerResult};
use crate::metrics::{MetricsSnapshot, MuxMetrics};
use crate::tracks::{plan_tracks, TrackTable};
use crate::MuxerConfig;

/// Pending operations on the serial context.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

type Reply<T> = Sender<MuxerResult<T>>;

enum MuxCommand {
    Start {
        reply: Reply<()>,
    },
    Process {
        buffer: SampleBuffer,
        kind: TrackKind,
        reply: Reply<bool>,
    },
    SetPaused {
        paused: bool,
        reply: Reply<()>,
    },
    Finish {
        reply: Reply<PathBuf>,
    },
}

/// State readable from any thread.
struct MuxShared {
    status: RwLock<ContainerStatus>,
    anchor: RwLock<Option<u64>>,
}

/// Multiplexes video, app audio and microphone samples into one container.
///
/// All public operations are handed to a dedicated thread and complete
/// synchronously for the caller. Only [`finish`](Self::finish) waits on
/// the writer.
pub struct Multiplexer {
    command_tx: Option<Sender<MuxCommand>>,
    shared: Arc<MuxShared>,
    metrics: Arc<MuxMetrics>,
    output_path: PathBuf,
    context: Option<JoinHandle<()>>,
}

impl Multiplexer {
    /// Create a multiplexer bound to a writer. Nothing is written until
    /// [`start`](Self::start).
    pub fn new(writer: Box<dyn ContainerWriter>, config: MuxerConfig) -> MuxerResult<Self> {
        let output_path = writer.output_path().to_path_buf();
        let shared = Arc::new(MuxShared {
            status: RwLock::new(ContainerStatus::Unstarted),
            anchor: RwLock::new(None),
        });
        let metrics = Arc::new(MuxMetrics::new());
        let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY);

        let context = MuxContext {
            writer,
            config,
            shared: Arc::clone(&shared),
            metrics: Arc::clone(&metrics),
            tracks: TrackTable::default(),
        };

        let handle = thread::Builder::new()
            .name("broadcast-mux".to_string())
            .spawn(move || context.run(command_rx))
            .map_err(|e| MuxerError::ContextClosed(format!("failed to spawn context: {}", e)))?;

        debug!(path = %output_path.display(), "Multiplexer created");

        Ok(Self {
            command_tx: Some(command_tx),
            shared,
            metrics,
            output_path,
            context: Some(handle),
        })
    }

    /// Register the supported tracks and begin writing.
    pub fn start(&self) -> MuxerResult<()> {
        self.request(|reply| MuxCommand::Start { reply })
    }

    /// Offer one sample buffer to a track.
    ///
    /// `Ok(false)` is a silent drop: invalid buffer, session not writing,
    /// timestamp before the anchor, or a full track input.
    pub fn process_buffer(&self, buffer: &SampleBuffer, kind: TrackKind) -> MuxerResult<bool> {
        let buffer = buffer.clone();
        self.request(|reply| MuxCommand::Process {
            buffer,
            kind,
            reply,
        })
    }

    /// Lifecycle hook for a paused broadcast.
    pub fn pause(&self) -> MuxerResult<()> {
        self.request(|reply| MuxCommand::SetPaused {
            paused: true,
            reply,
        })
    }

    /// Lifecycle hook for a resumed broadcast.
    pub fn resume(&self) -> MuxerResult<()> {
        self.request(|reply| MuxCommand::SetPaused {
            paused: false,
            reply,
        })
    }

    /// Finish every track, finalize the container and wait for the result.
    pub fn finish(&self) -> MuxerResult<PathBuf> {
        self.request(|reply| MuxCommand::Finish { reply })
    }

    /// Current container status.
    pub fn status(&self) -> ContainerStatus {
        *self.shared.status.read()
    }

    /// Session anchor in 100ns host ticks, once set.
    pub fn anchor(&self) -> Option<u64> {
        *self.shared.anchor.read()
    }

    /// Destination of the container.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Current ingestion counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> MuxCommand) -> MuxerResult<T> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| MuxerError::ContextClosed("multiplexer shut down".to_string()))?;

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        command_tx
            .send(command(reply_tx))
            .map_err(|_| MuxerError::ContextClosed("command loop stopped".to_string()))?;

        reply_rx
            .recv()
            .map_err(|_| MuxerError::ContextClosed("no reply from command loop".to_string()))?
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        // Closing the command channel ends the context loop.
        self.command_tx = None;
        if let Some(handle) = self.context.take() {
            let _ = handle.join();
        }
    }
}

/// State owned by the serial context.
struct MuxContext {
    writer: Box<dyn ContainerWriter>,
    config: MuxerConfig,
    shared: Arc<MuxShared>,
    metrics: Arc<MuxMetrics>,
    tracks: TrackTable,
}

impl MuxContext {
    fn run(mut self, command_rx: Receiver<MuxCommand>) {
        debug!("Multiplexer context started");

        while let Ok(command) = command_rx.recv() {
            match command {
                MuxCommand::Start { reply } => {
                    let _ = reply.send(self.start());
                }
                MuxCommand::Process {
                    buffer,
                    kind,
                    reply,
                } => {
                    let _ = reply.send(self.process(buffer, kind));
                }
                MuxCommand::SetPaused { paused, reply } => {
                    self.set_paused(paused);
                    let _ = reply.send(Ok(()));
                }
                MuxCommand::Finish { reply } => {
                    let _ = reply.send(self.finish());
                }
            }
        }

        self.teardown();
        debug!("Multiplexer context stopped");
    }

    fn status(&self) -> ContainerStatus {
        *self.shared.status.read()
    }

    fn transition_to(&self, status: ContainerStatus) {
        let previous = {
            let mut current = self.shared.status.write();
            let previous = *current;
            *current = status;
            previous
        };

        info!(
            previous = %previous.name(),
            current = %status.name(),
            "Container status transition"
        );
    }

    #[instrument(name = "mux_start", skip(self))]
    fn start(&mut self) -> MuxerResult<()> {
        let status = self.status();
        if status != ContainerStatus::Unstarted {
            return Err(MuxerError::WrongState(status));
        }

        let writer = &self.writer;
        let plan = plan_tracks(&self.config, |config| writer.can_add(config));
        for (kind, config) in plan {
            info!(track = kind.name(), ?config, "Adding track");
            self.writer.add_track(kind, config)?;
            self.tracks.register(kind);
        }

        self.writer.start_writing()?;
        self.metrics.start();
        self.transition_to(ContainerStatus::Writing);

        info!(
            path = %self.writer.output_path().display(),
            tracks = self.tracks.len(),
            "Multiplexer writing"
        );
        Ok(())
    }

    fn process(&mut self, buffer: SampleBuffer, kind: TrackKind) -> MuxerResult<bool> {
        if !buffer.is_usable() {
            trace!(track = kind.name(), "Dropping invalid buffer");
            self.metrics.record_invalid(kind);
            return Ok(false);
        }

        if !self.status().is_writing() {
            trace!(track = kind.name(), "Dropping buffer outside of writing");
            self.metrics.record_not_writing(kind);
            return Ok(false);
        }

        self.check_writer()?;

        let anchor = self.anchor_on(&buffer, kind);
        if buffer.pts_100ns < anchor {
            debug!(
                track = kind.name(),
                pts_ms = buffer.pts_ms(),
                "Dropping buffer older than the session anchor"
            );
            self.metrics.record_before_anchor(kind);
            return Ok(false);
        }

        if !self.writer.is_ready(kind) {
            debug!(track = kind.name(), "Track not ready, dropping buffer");
            self.metrics.record_backpressure(kind);
            return Ok(false);
        }

        let size = buffer.data.len();
        let sample = TimedSample {
            pts_100ns: buffer.pts_100ns - anchor,
            is_keyframe: buffer.is_keyframe,
            data: buffer.data,
        };

        match self.writer.append(kind, sample) {
            Ok(true) => {
                self.metrics.record_appended(kind, size);
                Ok(true)
            }
            Ok(false) => {
                debug!(track = kind.name(), "Append refused");
                self.metrics.record_backpressure(kind);
                Ok(false)
            }
            Err(e) => {
                error!(track = kind.name(), "Append failed: {}", e);
                self.transition_to(ContainerStatus::Failed);
                Err(MuxerError::Writer(e))
            }
        }
    }

    /// Surface a writer that faulted on its own.
    fn check_writer(&mut self) -> MuxerResult<()> {
        let err = match self.writer.status() {
            WriterStatus::Writing => return Ok(()),
            WriterStatus::Failed => {
                WriterError::Failed(self.writer.last_error().unwrap_or_default())
            }
            other => WriterError::WrongStatus(other),
        };

        error!("Writer is no longer writing: {}", err);
        self.transition_to(ContainerStatus::Failed);
        Err(MuxerError::Writer(err))
    }

    /// Anchor the session on the first buffer to get this far.
    fn anchor_on(&self, buffer: &SampleBuffer, kind: TrackKind) -> u64 {
        let mut anchor = self.shared.anchor.write();
        match *anchor {
            Some(pts) => pts,
            None => {
                info!(
                    track = kind.name(),
                    anchor_ms = buffer.pts_ms(),
                    "Session time anchored"
                );
                *anchor = Some(buffer.pts_100ns);
                buffer.pts_100ns
            }
        }
    }

    fn set_paused(&mut self, paused: bool) {
        info!(paused, status = %self.status().name(), "Broadcast pause state changed");
        self.metrics.set_paused(paused);
    }

    #[instrument(name = "mux_finish", skip(self))]
    fn finish(&mut self) -> MuxerResult<PathBuf> {
        let status = self.status();
        if !status.is_writing() {
            return Err(MuxerError::WrongState(status));
        }

        for kind in self.tracks.finish_all() {
            self.writer.mark_finished(kind);
        }
        self.transition_to(ContainerStatus::Finishing);

        // A writer that drops the callback unfired disconnects `done_rx`.
        let (done_tx, done_rx) = crossbeam_channel::bounded::<WriterResult<()>>(1);
        self.writer.finish_writing(Box::new(move |result| {
            if done_tx.try_send(result).is_err() {
                warn!("Finalization completed after the wait ended");
            }
        }));

        let outcome = match self.config.finish_timeout {
            Some(timeout) => done_rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => MuxerError::TimedOut(timeout),
                RecvTimeoutError::Disconnected => MuxerError::OwnerReleased,
            }),
            None => done_rx.recv().map_err(|_| MuxerError::OwnerReleased),
        };

        self.metrics.log_summary();

        match outcome {
            Ok(Ok(())) => {
                self.transition_to(ContainerStatus::Completed);
                let path = self.writer.output_path().to_path_buf();
                info!(path = %path.display(), "Container finalized");
                Ok(path)
            }
            Ok(Err(e)) => {
                error!("Finalization failed: {}", e);
                self.transition_to(ContainerStatus::Failed);
                Err(MuxerError::Writer(e))
            }
            Err(e) => {
                error!("Finalization did not complete: {}", e);
                self.transition_to(ContainerStatus::Failed);
                Err(e)
            }
        }
    }

    /// Abandon an unfinished container once the owner is gone.
    fn teardown(&mut self) {
        match self.status() {
            ContainerStatus::Writing => {
                warn!("Multiplexer dropped while writing, discarding container");
                self.writer.cancel();
                self.transition_to(ContainerStatus::Cancelled);
            }
            ContainerStatus::Unstarted => self.writer.cancel(),
            _ => {}
        }
    }
}
