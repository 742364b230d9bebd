//! Receiver pipeline coordinator
//!
//! Chains network callback → jitter buffer → depacketizer → decode and owns
//! the shutdown order of the pull side.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use super::decode_stage::DecodeStage;
use super::depacketizer::{Depacketizer, DepacketizerStats};
use super::jitter::PushOutcome;
use super::pop_timer::PopTimer;
use crate::codec::CodecService;
use crate::config::PipelineConfig;
use crate::emit_info;
use crate::error::{PipelineError, Result};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stage::StageWorker;
use crate::pipeline::state::StageState;
use crate::pipeline::types::{DecodedFrame, MediaPacket, StreamDescriptor};
use crate::telemetry::SharedTelemetry;

/// Coordinates the receiver pipeline: RTP → Jitter → Depacketize → Decode
///
/// `push_packet` may be called from any thread, before `start` as well;
/// packets simply accumulate in the jitter buffer until the timer runs.
pub struct ReceiverCoordinator {
    descriptor: StreamDescriptor,
    depacketizer: Arc<Depacketizer>,
    timer: PopTimer,
    decoder: StageWorker<DecodeStage>,
    packets: Arc<BoundedQueue<MediaPacket>>,
    frames: Arc<BoundedQueue<DecodedFrame>>,
    health: Arc<PipelineHealth>,
    telemetry: SharedTelemetry,
    started: bool,
}

impl ReceiverCoordinator {
    pub fn new(
        descriptor: StreamDescriptor,
        config: &PipelineConfig,
        service: Arc<dyn CodecService>,
        telemetry: SharedTelemetry,
    ) -> Self {
        let frames = Arc::new(BoundedQueue::with_config(&config.queue));
        Self::with_output(descriptor, config, service, frames, telemetry)
    }

    /// Build the pipeline around an existing frame queue, e.g. the input of a sender
    pub fn with_output(
        descriptor: StreamDescriptor,
        config: &PipelineConfig,
        service: Arc<dyn CodecService>,
        frames: Arc<BoundedQueue<DecodedFrame>>,
        telemetry: SharedTelemetry,
    ) -> Self {
        let health = Arc::new(PipelineHealth::new());
        let packets = Arc::new(BoundedQueue::with_config(&config.queue));

        let depacketizer = Arc::new(
            Depacketizer::new(descriptor, &config.jitter, packets.clone(), telemetry.clone())
                .with_health(health.clone()),
        );
        let timer = PopTimer::new(depacketizer.clone(), Duration::from_millis(config.jitter.tick_ms));
        let stage = DecodeStage::new(descriptor, service, frames.clone(), telemetry.clone());
        let decoder =
            StageWorker::new(stage, packets.clone(), telemetry.clone()).with_health(health.clone());

        Self {
            descriptor,
            depacketizer,
            timer,
            decoder,
            packets,
            frames,
            health,
            telemetry,
            started: false,
        }
    }

    /// Register a callback for fatal decoder errors
    pub fn on_error(
        mut self,
        callback: impl Fn(&'static str, &PipelineError) + Send + Sync + 'static,
    ) -> Self {
        self.decoder.set_error_callback(Arc::new(callback));
        self
    }

    /// Network-receive entry point
    pub fn push_packet(&self, data: impl Into<Bytes>) -> PushOutcome {
        self.depacketizer.push_packet(data)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.frames.reopen();
        self.decoder.start()?;
        if let Err(err) = self.timer.start() {
            self.decoder.stop();
            return Err(err);
        }
        self.started = true;
        emit_info!(
            self.telemetry,
            "receiver",
            "{} pipeline started (clock {} Hz)",
            self.descriptor.codec,
            self.descriptor.clock_rate
        );
        Ok(())
    }

    /// Stop the pull side.
    ///
    /// The timer is joined first so no pop races the flush; whatever the
    /// jitter buffer still holds is released, the decoder drains its queue
    /// and flushes, and only then is the packet queue cleared. Decoded frames
    /// stay in the output queue for the consumer.
    ///
    /// The output queue is closed up front: frames that find it full are
    /// dropped rather than waiting for a consumer that may never drain it.
    pub fn stop(&mut self) {
        if !self.started {
            self.decoder.stop();
            return;
        }
        self.frames.close();
        self.timer.stop();
        let flushed = self.depacketizer.flush();
        self.decoder.stop();
        let discarded = self.packets.clear();
        self.started = false;

        emit_info!(
            self.telemetry,
            "receiver",
            "pipeline stopped ({} flushed, {} discarded): {}",
            flushed,
            discarded,
            self.health.summary()
        );
    }

    pub fn is_running(&self) -> bool {
        self.started
    }

    pub fn decoder_state(&self) -> StageState {
        self.decoder.state()
    }

    /// Last fatal decoder error, if any
    pub fn take_error(&self) -> Option<PipelineError> {
        self.decoder.take_error()
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn depacketizer(&self) -> &Arc<Depacketizer> {
        &self.depacketizer
    }

    pub fn stats(&self) -> DepacketizerStats {
        self.depacketizer.stats()
    }

    pub fn packets(&self) -> &Arc<BoundedQueue<MediaPacket>> {
        &self.packets
    }

    /// Queue the decoded frames are delivered to
    pub fn frames(&self) -> &Arc<BoundedQueue<DecodedFrame>> {
        &self.frames
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }
}
