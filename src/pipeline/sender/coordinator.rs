//! Sender pipeline coordinator
//!
//! Chains reframe → encode → publish for an audio and/or a video track and
//! owns the shutdown order of the push side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::encode_stage::EncodeStage;
use super::publish_stage::PublisherDrain;
use super::reframer::{AudioReframer, ReframeStage};
use crate::codec::{CodecParams, CodecService};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stage::StageWorker;
use crate::pipeline::state::PublisherState;
use crate::pipeline::types::{DecodedFrame, MediaKind, MediaPacket};
use crate::sink::ContainerSink;
use crate::telemetry::SharedTelemetry;
use crate::{emit_info, emit_warn};

struct AudioPath {
    input: Arc<BoundedQueue<DecodedFrame>>,
    reframer: StageWorker<ReframeStage>,
    encoder: StageWorker<EncodeStage>,
}

struct VideoPath {
    input: Arc<BoundedQueue<DecodedFrame>>,
    encoder: StageWorker<EncodeStage>,
    keyframe: Arc<AtomicBool>,
}

/// Coordinates the sender pipeline
///
/// ```text
/// audio frames → Reframe → Encode ─┐
///                                  ├→ Publish → sink
/// video frames ──────────→ Encode ─┘
/// ```
pub struct SenderCoordinator {
    config: PipelineConfig,
    service: Arc<dyn CodecService>,
    audio: Option<AudioPath>,
    video: Option<VideoPath>,
    packets: Arc<BoundedQueue<MediaPacket>>,
    publisher: PublisherDrain,
    health: Arc<PipelineHealth>,
    telemetry: SharedTelemetry,
    started: bool,
}

impl SenderCoordinator {
    pub fn new(
        config: &PipelineConfig,
        service: Arc<dyn CodecService>,
        sink: Box<dyn ContainerSink>,
        telemetry: SharedTelemetry,
    ) -> Self {
        let health = Arc::new(PipelineHealth::new());
        let packets = Arc::new(BoundedQueue::with_config(&config.queue));
        let publisher = PublisherDrain::new(sink, &config.publisher, packets.clone(), telemetry.clone())
            .with_health(health.clone());

        Self {
            config: config.clone(),
            service,
            audio: None,
            video: None,
            packets,
            publisher,
            health,
            telemetry,
            started: false,
        }
    }

    /// Add an audio track. The encoder is opened here so the reframer can be
    /// sized to the frame size it requires.
    pub fn with_audio(mut self, params: CodecParams) -> Result<Self> {
        if params.kind() != MediaKind::Audio {
            return Err(PipelineError::Config(format!("{} is not an audio codec", params.codec)));
        }
        let reframed = Arc::new(BoundedQueue::with_config(&self.config.queue));
        let stage = EncodeStage::new(params, self.service.clone(), self.packets.clone(), self.telemetry.clone())?;

        let mut reframer = AudioReframer::new(&self.config.audio);
        if let Some(frame_size) = stage.frame_size() {
            reframer = reframer.with_frame_size(frame_size);
        }

        let input = Arc::new(BoundedQueue::with_config(&self.config.queue));
        let reframer = StageWorker::new(
            ReframeStage::new(reframer, reframed.clone(), self.telemetry.clone()),
            input.clone(),
            self.telemetry.clone(),
        )
        .with_health(self.health.clone());
        let encoder = StageWorker::new(stage, reframed, self.telemetry.clone()).with_health(self.health.clone());

        self.audio = Some(AudioPath {
            input,
            reframer,
            encoder,
        });
        Ok(self)
    }

    pub fn with_video(mut self, params: CodecParams) -> Result<Self> {
        if params.kind() != MediaKind::Video {
            return Err(PipelineError::Config(format!("{} is not a video codec", params.codec)));
        }
        let stage = EncodeStage::new(params, self.service.clone(), self.packets.clone(), self.telemetry.clone())?;
        let keyframe = stage.keyframe_handle();

        let input = Arc::new(BoundedQueue::with_config(&self.config.queue));
        let encoder =
            StageWorker::new(stage, input.clone(), self.telemetry.clone()).with_health(self.health.clone());

        self.video = Some(VideoPath {
            input,
            encoder,
            keyframe,
        });
        Ok(self)
    }

    /// Register a callback for fatal errors of the publisher
    pub fn on_error(
        mut self,
        callback: impl Fn(&'static str, &PipelineError) + Send + Sync + 'static,
    ) -> Self {
        self.publisher.set_error_callback(Arc::new(callback));
        self
    }

    /// Queue a raw frame on the path of its kind.
    ///
    /// Returns `false` when there is no such path or the frame was cancelled
    /// by a stop.
    pub fn push_frame(&self, frame: DecodedFrame) -> bool {
        let input = match frame.kind() {
            MediaKind::Audio => self.audio.as_ref().map(|a| &a.input),
            MediaKind::Video => self.video.as_ref().map(|v| &v.input),
        };
        match input {
            Some(input) => input.enqueue(frame),
            None => false,
        }
    }

    /// Ask the video encoder for an intra frame
    pub fn request_keyframe(&self) {
        if let Some(video) = &self.video {
            video.keyframe.store(true, Ordering::Relaxed);
        }
    }

    /// Start the publisher first, then the encoders, then the reframer
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if self.audio.is_none() && self.video.is_none() {
            return Err(PipelineError::Config("sender has no tracks".into()));
        }

        self.publisher.start()?;
        let started = self.start_paths();
        if let Err(err) = started {
            self.stop_paths();
            self.publisher.stop();
            return Err(err);
        }

        self.started = true;
        emit_info!(
            self.telemetry,
            "sender",
            "pipeline started (audio: {}, video: {})",
            self.audio.is_some(),
            self.video.is_some()
        );
        Ok(())
    }

    fn start_paths(&mut self) -> Result<()> {
        if let Some(video) = self.video.as_mut() {
            video.encoder.start()?;
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.encoder.start()?;
            audio.reframer.start()?;
        }
        Ok(())
    }

    /// Upstream first: every stage drains into the next before it stops
    fn stop_paths(&mut self) {
        if let Some(audio) = self.audio.as_mut() {
            audio.reframer.stop();
            audio.encoder.stop();
        }
        if let Some(video) = self.video.as_mut() {
            video.encoder.stop();
        }
    }

    /// Stop the push side.
    ///
    /// The reframer flushes its padded tail, the encoders flush their delayed
    /// packets and the publisher writes everything followed by the trailer.
    /// A stopped sender cannot be restarted.
    pub fn stop(&mut self) {
        self.stop_paths();
        self.publisher.stop();

        let mut discarded = self.packets.clear();
        if let Some(audio) = &self.audio {
            discarded += audio.input.clear();
        }
        if let Some(video) = &self.video {
            discarded += video.input.clear();
        }
        if discarded > 0 {
            emit_warn!(self.telemetry, "sender", "{} items discarded on stop", discarded);
        }

        if self.started {
            self.started = false;
            emit_info!(self.telemetry, "sender", "pipeline stopped: {}", self.health.summary());
        }
    }

    pub fn is_running(&self) -> bool {
        self.started
    }

    pub fn publisher_state(&self) -> PublisherState {
        self.publisher.state()
    }

    /// Last fatal publisher error, if any
    pub fn take_error(&self) -> Option<PipelineError> {
        self.publisher.take_error()
    }

    pub fn audio_input(&self) -> Option<&Arc<BoundedQueue<DecodedFrame>>> {
        self.audio.as_ref().map(|a| &a.input)
    }

    pub fn video_input(&self) -> Option<&Arc<BoundedQueue<DecodedFrame>>> {
        self.video.as_ref().map(|v| &v.input)
    }

    /// Encoded packets waiting for the publisher
    pub fn packets(&self) -> &Arc<BoundedQueue<MediaPacket>> {
        &self.packets
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }
}

impl Drop for SenderCoordinator {
    fn drop(&mut self) {
        if self.started {
            self.stop();
        }
    }
}
