//! Decode stage for the receiver pipeline
//!
//! Feeds depacketized elementary-stream packets into a codec-service decoder
//! and forwards the decoded frames. Video is gated on the first keyframe:
//! nothing reaches the decoder before an access unit carrying an IDR slice or
//! parameter sets.

use std::sync::Arc;

use super::depacketizer::{NAL_IDR, NAL_SPS, contains_nal_type};
use crate::codec::{CodecParams, CodecService, Decoder};
use crate::error::{PipelineError, Result};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::{DecodedFrame, MediaKind, MediaPacket, StreamDescriptor};
use crate::telemetry::SharedTelemetry;
use crate::{emit_debug, emit_info};

const NAL_PPS: u8 = 8;

/// Consecutive decoder failures after which the keyframe gate closes again
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Return true if the access unit contains an IDR slice or SPS/PPS
pub fn is_decodable_entry_point(au: &[u8]) -> bool {
    [NAL_IDR, NAL_SPS, NAL_PPS]
        .into_iter()
        .any(|t| contains_nal_type(au, t))
}

pub struct DecodeStage {
    descriptor: StreamDescriptor,
    service: Arc<dyn CodecService>,
    decoder: Option<Box<dyn Decoder>>,
    output: Arc<BoundedQueue<DecodedFrame>>,
    telemetry: SharedTelemetry,
    waiting_for_keyframe: bool,
    consecutive_failures: u32,
    frames_decoded: u64,
}

impl DecodeStage {
    pub fn new(
        descriptor: StreamDescriptor,
        service: Arc<dyn CodecService>,
        output: Arc<BoundedQueue<DecodedFrame>>,
        telemetry: SharedTelemetry,
    ) -> Self {
        Self {
            descriptor,
            service,
            decoder: None,
            output,
            telemetry,
            waiting_for_keyframe: descriptor.kind() == MediaKind::Video,
            consecutive_failures: 0,
            frames_decoded: 0,
        }
    }

    pub fn output(&self) -> &Arc<BoundedQueue<DecodedFrame>> {
        &self.output
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn is_waiting_for_keyframe(&self) -> bool {
        self.waiting_for_keyframe
    }

    fn forward(&mut self, frame: DecodedFrame) -> Result<()> {
        self.frames_decoded += 1;
        if !self.output.enqueue(frame) {
            return Err(PipelineError::dropped(self.name(), "frame, output queue cleared or closed"));
        }
        Ok(())
    }

    fn drain_decoder(&mut self) -> Result<()> {
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(());
            };
            match decoder.receive()? {
                Some(frame) => self.forward(frame)?,
                None => return Ok(()),
            }
        }
    }

    fn decode(&mut self, packet: MediaPacket) -> Result<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(PipelineError::fatal(self.name(), "decoder is not open"));
        };
        decoder.send(packet)?;
        self.drain_decoder()
    }

    fn on_failure(&mut self, err: PipelineError) -> PipelineError {
        self.consecutive_failures += 1;
        if self.descriptor.kind() == MediaKind::Video
            && self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
        {
            self.consecutive_failures = 0;
            self.waiting_for_keyframe = true;
            return PipelineError::reset(
                self.name(),
                format!("{} consecutive failures, waiting for keyframe ({})", MAX_CONSECUTIVE_FAILURES, err),
            );
        }
        err
    }
}

impl PipelineStage for DecodeStage {
    type Input = MediaPacket;

    fn name(&self) -> &'static str {
        "decode"
    }

    fn measure(&self, item: &MediaPacket) -> (usize, bool) {
        (item.size(), item.is_keyframe)
    }

    fn on_start(&mut self) -> Result<()> {
        if self.decoder.is_none() {
            let params = CodecParams::for_stream(&self.descriptor);
            self.decoder = Some(self.service.open_decoder(&params)?);
            emit_info!(self.telemetry, self.name(), "{} decoder opened", self.descriptor.codec);
        }
        Ok(())
    }

    fn process(&mut self, packet: MediaPacket) -> Result<()> {
        if packet.data.is_empty() {
            return Err(PipelineError::dropped(self.name(), "empty packet"));
        }

        if self.waiting_for_keyframe {
            if !is_decodable_entry_point(&packet.data) {
                emit_debug!(self.telemetry, self.name(), "skipping packet before first keyframe");
                return Ok(());
            }
            self.waiting_for_keyframe = false;
            emit_info!(self.telemetry, self.name(), "received first keyframe");
        }

        match self.decode(packet) {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(err) if err.is_fatal() || matches!(err, PipelineError::Dropped { .. }) => Err(err),
            Err(err) => Err(self.on_failure(err)),
        }
    }

    fn on_stop(&mut self) -> Result<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        decoder.flush()?;
        self.drain_decoder()?;
        emit_info!(
            self.telemetry,
            self.name(),
            "finished ({} decoded frames)",
            self.frames_decoded
        );
        // the decoder cannot be fed after a flush
        self.decoder = None;
        self.waiting_for_keyframe = self.descriptor.kind() == MediaKind::Video;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LoopbackCodec;
    use crate::error::CodecError;
    use crate::pipeline::types::{FrameData, Rational};
    use crate::telemetry::NullTelemetry;
    use bytes::Bytes;
    use std::time::Duration;

    fn output() -> Arc<BoundedQueue<DecodedFrame>> {
        Arc::new(BoundedQueue::new(64, Duration::from_millis(50)))
    }

    fn video(nal: &[u8], ts: i64) -> MediaPacket {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(nal);
        MediaPacket::new(MediaKind::Video, Bytes::from(data), ts, Rational::per_second(90_000))
    }

    #[test]
    fn test_entry_point_detection() {
        assert!(is_decodable_entry_point(&[0, 0, 0, 1, 0x65, 1]));
        assert!(is_decodable_entry_point(&[0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x68]));
        assert!(!is_decodable_entry_point(&[0, 0, 0, 1, 0x41, 1]));
        assert!(!is_decodable_entry_point(&[]));
    }

    #[test]
    fn test_video_gated_on_keyframe() {
        let out = output();
        let mut stage = DecodeStage::new(
            StreamDescriptor::h264().with_dimensions(2, 2),
            Arc::new(LoopbackCodec::new()),
            out.clone(),
            Arc::new(NullTelemetry),
        );
        stage.on_start().unwrap();
        assert!(stage.is_waiting_for_keyframe());

        stage.process(video(&[0x41, 0xAA], 0)).unwrap();
        assert!(out.is_empty());

        stage.process(video(&[0x65, 0xBB], 3000)).unwrap();
        stage.process(video(&[0x41, 0xCC], 6000)).unwrap();
        assert!(!stage.is_waiting_for_keyframe());
        assert_eq!(stage.frames_decoded(), 2);

        let first = out.try_dequeue().unwrap();
        assert_eq!(first.pts, Some(3000));
        match first.data {
            FrameData::Video(buffer) => assert_eq!(&buffer.data[4..], &[0x65, 0xBB]),
            FrameData::Audio(_) => panic!("expected video"),
        }
    }

    #[test]
    fn test_audio_not_gated() {
        let out = output();
        let mut stage = DecodeStage::new(
            StreamDescriptor::opus(48_000, 1),
            Arc::new(LoopbackCodec::new()),
            out.clone(),
            Arc::new(NullTelemetry),
        );
        stage.on_start().unwrap();
        let packet = MediaPacket::new(MediaKind::Audio, Bytes::from_static(&[1, 0, 2, 0]), 480, Rational::per_second(48_000));
        stage.process(packet).unwrap();
        assert_eq!(out.try_dequeue().unwrap().sample_count(), 2);
    }

    struct FailingDecoder;

    impl Decoder for FailingDecoder {
        fn send(&mut self, _packet: MediaPacket) -> std::result::Result<(), CodecError> {
            Err(CodecError::Send("corrupt".into()))
        }
        fn receive(&mut self) -> std::result::Result<Option<DecodedFrame>, CodecError> {
            Ok(None)
        }
        fn flush(&mut self) -> std::result::Result<(), CodecError> {
            Ok(())
        }
    }

    struct FailingService;

    impl CodecService for FailingService {
        fn open_decoder(&self, _params: &CodecParams) -> std::result::Result<Box<dyn Decoder>, CodecError> {
            Ok(Box::new(FailingDecoder))
        }
        fn open_encoder(
            &self,
            _params: &CodecParams,
        ) -> std::result::Result<Box<dyn crate::codec::Encoder>, CodecError> {
            Err(CodecError::Unavailable("none".into()))
        }
    }

    #[test]
    fn test_consecutive_failures_reset_gate() {
        let mut stage = DecodeStage::new(
            StreamDescriptor::h264(),
            Arc::new(FailingService),
            output(),
            Arc::new(NullTelemetry),
        );
        stage.on_start().unwrap();

        for i in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            let err = stage.process(video(&[0x65, 1], i as i64)).unwrap_err();
            assert!(matches!(err, PipelineError::Codec(CodecError::Send(_))));
        }
        let err = stage.process(video(&[0x65, 1], 99)).unwrap_err();
        assert!(matches!(err, PipelineError::Reset { .. }));
        assert!(stage.is_waiting_for_keyframe());
    }

    #[test]
    fn test_open_failure_is_fatal() {
        struct Unavailable;
        impl CodecService for Unavailable {
            fn open_decoder(&self, _p: &CodecParams) -> std::result::Result<Box<dyn Decoder>, CodecError> {
                Err(CodecError::Unavailable("h264".into()))
            }
            fn open_encoder(
                &self,
                _p: &CodecParams,
            ) -> std::result::Result<Box<dyn crate::codec::Encoder>, CodecError> {
                Err(CodecError::Unavailable("h264".into()))
            }
        }
        let mut stage = DecodeStage::new(
            StreamDescriptor::h264(),
            Arc::new(Unavailable),
            output(),
            Arc::new(NullTelemetry),
        );
        assert!(stage.on_start().unwrap_err().is_fatal());
    }
}
