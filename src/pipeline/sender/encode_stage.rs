//! Encode stage for the sender pipeline
//!
//! Feeds raw frames to a codec-service encoder and forwards the encoded
//! packets to the publish queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::{CodecParams, CodecService, Encoder};
use crate::error::{PipelineError, Result};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::{DecodedFrame, FrameData, MediaKind, MediaPacket, Rational};
use crate::telemetry::SharedTelemetry;
use crate::{emit_debug, emit_info};

/// Encode stage: transforms raw frames into encoded packets
///
/// Frames without a timestamp are stamped from a running counter in the
/// encoder timebase: the sample count for audio, the frame count for video.
pub struct EncodeStage {
    params: CodecParams,
    service: Arc<dyn CodecService>,
    encoder: Option<Box<dyn Encoder>>,
    output: Arc<BoundedQueue<MediaPacket>>,
    telemetry: SharedTelemetry,
    /// Force a keyframe on the next frame
    force_keyframe: Arc<AtomicBool>,
    next_pts: i64,
    frames_in: u64,
    packets_out: u64,
    packets_dropped: u64,
}

impl EncodeStage {
    /// Open the encoder right away so its frame size is known before the
    /// pipeline is wired.
    pub fn new(
        params: CodecParams,
        service: Arc<dyn CodecService>,
        output: Arc<BoundedQueue<MediaPacket>>,
        telemetry: SharedTelemetry,
    ) -> Result<Self> {
        let encoder = service.open_encoder(&params)?;
        emit_info!(telemetry, "encode", "{} encoder opened ({})", params.codec, params.timebase);
        Ok(Self {
            params,
            service,
            encoder: Some(encoder),
            output,
            telemetry,
            force_keyframe: Arc::new(AtomicBool::new(false)),
            next_pts: 0,
            frames_in: 0,
            packets_out: 0,
            packets_dropped: 0,
        })
    }

    /// Ask for an intra frame on the next encoded video frame
    pub fn request_keyframe(&self) {
        self.force_keyframe.store(true, Ordering::Relaxed);
    }

    /// Handle to request keyframes while the stage is owned by a worker
    pub fn keyframe_handle(&self) -> Arc<AtomicBool> {
        self.force_keyframe.clone()
    }

    pub fn kind(&self) -> MediaKind {
        self.params.kind()
    }

    /// Samples per frame the encoder requires, for audio encoders
    pub fn frame_size(&self) -> Option<usize> {
        self.encoder
            .as_ref()
            .and_then(|e| e.frame_size())
            .or(self.params.frame_size)
    }

    pub fn timebase(&self) -> Rational {
        self.encoder
            .as_ref()
            .map_or(self.params.timebase, |e| e.timebase())
    }

    pub fn packets_out(&self) -> u64 {
        self.packets_out
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    /// Fill in a missing pts and advance the running counter
    fn stamp(&mut self, frame: &mut DecodedFrame) {
        let tb = self.timebase();
        let pts = match frame.pts {
            Some(pts) => frame.timebase.rescale(pts, tb),
            None => self.next_pts,
        };
        frame.pts = Some(pts);
        frame.timebase = tb;

        self.next_pts = match &frame.data {
            FrameData::Audio(buffer) => {
                pts + Rational::per_second(buffer.format.sample_rate).rescale(buffer.samples as i64, tb)
            }
            FrameData::Video(_) => pts + 1,
        };
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            let Some(encoder) = self.encoder.as_mut() else {
                return Ok(());
            };
            let Some(packet) = encoder.receive()? else {
                return Ok(());
            };

            if packet.data.is_empty() || packet.pts.is_none() {
                self.packets_dropped += 1;
                emit_debug!(self.telemetry, self.name(), "dropping unusable encoder output {:?}", packet);
                continue;
            }
            if !self.output.enqueue(packet) {
                return Err(PipelineError::dropped(self.name(), "packet, output queue cleared or closed"));
            }
            self.packets_out += 1;
        }
    }
}

impl PipelineStage for EncodeStage {
    type Input = DecodedFrame;

    fn name(&self) -> &'static str {
        "encode"
    }

    fn measure(&self, item: &DecodedFrame) -> (usize, bool) {
        (item.sample_count(), false)
    }

    fn on_start(&mut self) -> Result<()> {
        if self.encoder.is_none() {
            self.encoder = Some(self.service.open_encoder(&self.params)?);
            emit_info!(self.telemetry, self.name(), "{} encoder reopened", self.params.codec);
        }
        Ok(())
    }

    fn process(&mut self, mut frame: DecodedFrame) -> Result<()> {
        if frame.kind() != self.kind() {
            return Err(PipelineError::dropped(self.name(), format!("{} frame", frame.kind())));
        }
        self.stamp(&mut frame);
        self.frames_in += 1;

        let keyframe = self.force_keyframe.swap(false, Ordering::Relaxed);
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(PipelineError::fatal(self.name(), "encoder is not open"));
        };
        encoder.send(frame, keyframe)?;
        self.drain()
    }

    fn on_stop(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        encoder.flush()?;
        self.drain()?;
        emit_info!(
            self.telemetry,
            self.name(),
            "finished ({} frames in, {} packets out, {} dropped)",
            self.frames_in,
            self.packets_out,
            self.packets_dropped
        );
        // an encoder cannot be fed after a flush
        self.encoder = None;
        self.next_pts = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LoopbackCodec;
    use crate::config::AudioConfig;
    use crate::pipeline::types::{AudioBuffer, AudioFormat, CodecId, PixelFormat, VideoBuffer};
    use crate::telemetry::NullTelemetry;
    use bytes::Bytes;
    use std::time::Duration;

    fn queue() -> Arc<BoundedQueue<MediaPacket>> {
        Arc::new(BoundedQueue::new(64, Duration::from_millis(50)))
    }

    fn audio_frame(audio: &AudioConfig, pts: Option<i64>) -> DecodedFrame {
        let format = AudioFormat::new(audio.sample_rate, audio.channels, audio.sample_format);
        DecodedFrame::audio(AudioBuffer::silence(format, audio.frame_size), pts, audio.timebase)
    }

    fn video_frame(pts: Option<i64>) -> DecodedFrame {
        let buffer = VideoBuffer {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Yuv420p,
            data: Bytes::from_static(&[1, 2, 3, 4, 5, 6]),
        };
        DecodedFrame::video(buffer, pts, Rational::new(1, 30))
    }

    #[test]
    fn test_audio_counter_pts() {
        let audio = AudioConfig::default();
        let out = queue();
        let mut stage = EncodeStage::new(
            CodecParams::audio_encoder(CodecId::Opus, &audio),
            Arc::new(LoopbackCodec::new()),
            out.clone(),
            Arc::new(NullTelemetry),
        )
        .unwrap();
        assert_eq!(stage.frame_size(), Some(960));

        stage.process(audio_frame(&audio, None)).unwrap();
        stage.process(audio_frame(&audio, None)).unwrap();
        let pts: Vec<_> = std::iter::from_fn(|| out.try_dequeue()).map(|p| p.pts).collect();
        assert_eq!(pts, vec![Some(0), Some(960)]);
    }

    #[test]
    fn test_keyframe_request_and_video_counter() {
        let out = queue();
        let mut stage = EncodeStage::new(
            CodecParams::video_encoder(CodecId::H264, 2, 2, Rational::new(1, 30)),
            Arc::new(LoopbackCodec::new()),
            out.clone(),
            Arc::new(NullTelemetry),
        )
        .unwrap();

        stage.process(video_frame(None)).unwrap();
        stage.process(video_frame(None)).unwrap();
        stage.request_keyframe();
        stage.process(video_frame(None)).unwrap();

        let packets: Vec<_> = std::iter::from_fn(|| out.try_dequeue()).collect();
        let keys: Vec<_> = packets.iter().map(|p| p.is_keyframe).collect();
        assert_eq!(keys, vec![true, false, true]);
        let pts: Vec<_> = packets.iter().map(|p| p.pts).collect();
        assert_eq!(pts, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_stop_flushes_delayed_packets() {
        let audio = AudioConfig::default();
        let out = queue();
        let mut stage = EncodeStage::new(
            CodecParams::audio_encoder(CodecId::Opus, &audio),
            Arc::new(LoopbackCodec::new().with_encoder_delay(3)),
            out.clone(),
            Arc::new(NullTelemetry),
        )
        .unwrap();

        for i in 0..3 {
            stage.process(audio_frame(&audio, Some(i * 960))).unwrap();
        }
        assert!(out.is_empty());

        stage.on_stop().unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(stage.packets_out(), 3);

        // restart reopens the encoder
        stage.on_start().unwrap();
        stage.process(audio_frame(&audio, Some(0))).unwrap();
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let audio = AudioConfig::default();
        let mut stage = EncodeStage::new(
            CodecParams::audio_encoder(CodecId::Opus, &audio),
            Arc::new(LoopbackCodec::new()),
            queue(),
            Arc::new(NullTelemetry),
        )
        .unwrap();
        let err = stage.process(video_frame(Some(0))).unwrap_err();
        assert!(matches!(err, PipelineError::Dropped { .. }));
    }
}
