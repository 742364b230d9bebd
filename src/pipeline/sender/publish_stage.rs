//! Publish stage: the last hop before the container / transport
//!
//! Every encoded packet is routed to the track of its media kind, its
//! timestamps are rescaled from the encoder timebase into the track
//! timebase, and it is validated before the write:
//!
//! - empty payloads and packets for a kind without a track are dropped;
//! - video packets whose rescaled dts lies after their pts are dropped;
//! - with `enforce_monotonic_dts`, a dts that goes backwards on its track
//!   is dropped. Equal dts values pass: the NAL units of one access unit
//!   share a timestamp.
//!
//! A failed write means the connection is gone: the stage stops itself and
//! reports a fatal error. The trailer is written exactly once, when the
//! stage stops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::PublisherConfig;
use crate::error::{PipelineError, Result, SinkError};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stage::{ErrorCallback, PipelineStage, StageWorker};
use crate::pipeline::state::{PublisherState, StageState};
use crate::pipeline::types::{MediaKind, MediaPacket};
use crate::sink::ContainerSink;
use crate::telemetry::SharedTelemetry;
use crate::{emit_error, emit_info};

const STAGE: &str = "publish";

pub struct PublishStage {
    sink: Box<dyn ContainerSink>,
    telemetry: SharedTelemetry,
    enforce_monotonic_dts: bool,
    last_dts: [Option<i64>; 2],
    trailer_written: Arc<AtomicBool>,
    packets_written: u64,
}

fn track_index(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Video => 0,
        MediaKind::Audio => 1,
    }
}

impl PublishStage {
    pub fn new(sink: Box<dyn ContainerSink>, config: &PublisherConfig, telemetry: SharedTelemetry) -> Self {
        Self {
            sink,
            telemetry,
            enforce_monotonic_dts: config.enforce_monotonic_dts,
            last_dts: [None; 2],
            trailer_written: Arc::new(AtomicBool::new(false)),
            packets_written: 0,
        }
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    pub fn trailer_written(&self) -> bool {
        self.trailer_written.load(Ordering::SeqCst)
    }

    /// Rescale and validate; `Err` carries the reason for dropping
    fn prepare(&self, mut packet: MediaPacket) -> Result<MediaPacket> {
        if packet.data.is_empty() {
            return Err(PipelineError::dropped(STAGE, "packet with empty payload"));
        }
        let Some(track_tb) = self.sink.timebase(packet.kind) else {
            return Err(SinkError::NoTrack(packet.kind).into());
        };

        let from = packet.timebase;
        packet.pts = packet.pts.map(|v| from.rescale(v, track_tb));
        packet.dts = packet.dts.map(|v| from.rescale(v, track_tb));
        packet.duration = from.rescale(packet.duration, track_tb);
        packet.timebase = track_tb;

        if packet.kind == MediaKind::Video
            && let (Some(pts), Some(dts)) = (packet.pts, packet.dts)
            && dts > pts
        {
            return Err(PipelineError::dropped(
                STAGE,
                format!("video packet with dts {} > pts {}", dts, pts),
            ));
        }

        if self.enforce_monotonic_dts
            && let (Some(dts), Some(last)) = (packet.dts, self.last_dts[track_index(packet.kind)])
            && dts < last
        {
            return Err(PipelineError::dropped(
                STAGE,
                format!("{} packet with dts {} before {}", packet.kind, dts, last),
            ));
        }
        Ok(packet)
    }
}

impl PipelineStage for PublishStage {
    type Input = MediaPacket;

    fn name(&self) -> &'static str {
        STAGE
    }

    fn measure(&self, item: &MediaPacket) -> (usize, bool) {
        (item.size(), item.is_keyframe)
    }

    fn process(&mut self, packet: MediaPacket) -> Result<()> {
        let encoder_tb = packet.timebase;
        let packet = self.prepare(packet)?;
        let (kind, pts, dts, size, key, track_tb) = (
            packet.kind,
            packet.pts,
            packet.dts,
            packet.size(),
            packet.is_keyframe,
            packet.timebase,
        );

        if let Err(err) = self.sink.write(packet) {
            emit_error!(
                self.telemetry,
                STAGE,
                "write failed: {} packet pts={:?} dts={:?} size={} key={} encoder_tb={} track_tb={}",
                kind,
                pts,
                dts,
                size,
                key,
                encoder_tb,
                track_tb
            );
            return Err(err.into());
        }
        if dts.is_some() {
            self.last_dts[track_index(kind)] = dts;
        }
        self.packets_written += 1;
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        if self.trailer_written.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sink.write_trailer()?;
        emit_info!(self.telemetry, STAGE, "trailer written after {} packets", self.packets_written);
        Ok(())
    }
}

/// Drain-preserving publisher: a [`PublishStage`] on its own worker
///
/// `stop()` returns once every packet queued before the call has been
/// written and the trailer is out.
pub struct PublisherDrain {
    worker: StageWorker<PublishStage>,
    trailer_written: Arc<AtomicBool>,
}

impl PublisherDrain {
    pub fn new(
        sink: Box<dyn ContainerSink>,
        config: &PublisherConfig,
        input: Arc<BoundedQueue<MediaPacket>>,
        telemetry: SharedTelemetry,
    ) -> Self {
        let stage = PublishStage::new(sink, config, telemetry.clone());
        let trailer_written = stage.trailer_written.clone();
        Self {
            worker: StageWorker::new(stage, input, telemetry),
            trailer_written,
        }
    }

    pub fn with_health(mut self, health: Arc<PipelineHealth>) -> Self {
        self.worker = self.worker.with_health(health);
        self
    }

    /// Register a callback for fatal write errors
    pub fn on_error(
        mut self,
        callback: impl Fn(&'static str, &PipelineError) + Send + Sync + 'static,
    ) -> Self {
        self.set_error_callback(Arc::new(callback));
        self
    }

    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.worker.set_error_callback(callback);
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state() == PublisherState::Stopped {
            return Err(PipelineError::fatal(STAGE, "publisher already stopped"));
        }
        self.worker.start()
    }

    /// Drain the queue, write the trailer and stop. Idempotent.
    pub fn stop(&mut self) {
        self.worker.stop();
    }

    pub fn state(&self) -> PublisherState {
        if self.trailer_written.load(Ordering::SeqCst) {
            return PublisherState::Stopped;
        }
        match self.worker.state() {
            StageState::Idle => PublisherState::Idle,
            StageState::Running => PublisherState::Publishing,
            StageState::Draining => PublisherState::Draining,
        }
    }

    pub fn take_error(&self) -> Option<PipelineError> {
        self.worker.take_error()
    }

    pub fn input(&self) -> &Arc<BoundedQueue<MediaPacket>> {
        self.worker.input()
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        self.worker.health()
    }

    /// Packets written so far; only available while the worker is stopped
    pub fn packets_written(&self) -> Option<u64> {
        self.worker.stage().map(PublishStage::packets_written)
    }
}
