//! Pure-Rust codec service that moves raw samples without compressing them
//!
//! Audio "bitstreams" are interleaved native-endian 16 bit PCM; video
//! bitstreams are passed through as opaque frame bytes. The service is used
//! when no FFmpeg build is available and by the test-suite, where its
//! `encoder_delay` knob emulates encoders that hold packets until flush.

use bytes::Bytes;
use std::collections::VecDeque;

use super::{CodecParams, CodecService, Decoder, Encoder};
use crate::error::CodecError;
use crate::pipeline::types::{
    AudioBuffer, AudioFormat, DecodedFrame, FrameData, MediaKind, MediaPacket, PixelFormat,
    Rational, SampleFormat, VideoBuffer,
};

#[derive(Debug, Clone, Default)]
pub struct LoopbackCodec {
    encoder_delay: usize,
}

impl LoopbackCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoders keep up to `packets` packets buffered until `flush`
    pub fn with_encoder_delay(mut self, packets: usize) -> Self {
        self.encoder_delay = packets;
        self
    }
}

impl CodecService for LoopbackCodec {
    fn open_decoder(&self, params: &CodecParams) -> Result<Box<dyn Decoder>, CodecError> {
        check_params(params)?;
        Ok(Box::new(LoopbackDecoder {
            params: params.clone(),
            frames: VecDeque::new(),
            flushed: false,
        }))
    }

    fn open_encoder(&self, params: &CodecParams) -> Result<Box<dyn Encoder>, CodecError> {
        check_params(params)?;
        Ok(Box::new(LoopbackEncoder {
            params: params.clone(),
            delay: self.encoder_delay,
            packets: VecDeque::new(),
            frames_in: 0,
            flushed: false,
        }))
    }
}

fn check_params(params: &CodecParams) -> Result<(), CodecError> {
    if !params.timebase.is_valid() {
        return Err(CodecError::Open(format!("invalid timebase {}", params.timebase)));
    }
    if params.kind() == MediaKind::Audio
        && (params.sample_rate == Some(0) || params.channels == Some(0))
    {
        return Err(CodecError::Open("audio stream without samples".into()));
    }
    Ok(())
}

fn audio_format(params: &CodecParams) -> AudioFormat {
    AudioFormat::new(
        params.sample_rate.unwrap_or(48_000),
        params.channels.unwrap_or(1),
        SampleFormat::S16,
    )
}

struct LoopbackDecoder {
    params: CodecParams,
    frames: VecDeque<DecodedFrame>,
    flushed: bool,
}

impl Decoder for LoopbackDecoder {
    fn send(&mut self, packet: MediaPacket) -> Result<(), CodecError> {
        if packet.kind != self.params.kind() {
            return Err(CodecError::WrongKind(packet.kind));
        }
        if self.flushed {
            return Err(CodecError::Send("decoder already flushed".into()));
        }

        let frame = match packet.kind {
            MediaKind::Audio => {
                let format = audio_format(&self.params);
                let frame_bytes = 2 * format.channels as usize;
                if packet.data.is_empty() || packet.data.len() % frame_bytes != 0 {
                    return Err(CodecError::Send(format!(
                        "{} bytes is not a whole number of {} channel frames",
                        packet.data.len(),
                        format.channels
                    )));
                }
                let buffer = AudioBuffer {
                    format,
                    samples: packet.data.len() / frame_bytes,
                    planes: vec![packet.data],
                };
                DecodedFrame::audio(buffer, packet.pts, packet.timebase)
            }
            MediaKind::Video => {
                let buffer = VideoBuffer {
                    width: self.params.width.unwrap_or(0),
                    height: self.params.height.unwrap_or(0),
                    pixel_format: PixelFormat::Yuv420p,
                    data: packet.data,
                };
                DecodedFrame::video(buffer, packet.pts, packet.timebase)
            }
        };
        self.frames.push_back(frame);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        Ok(self.frames.pop_front())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.flushed = true;
        Ok(())
    }
}

struct LoopbackEncoder {
    params: CodecParams,
    delay: usize,
    packets: VecDeque<MediaPacket>,
    frames_in: u64,
    flushed: bool,
}

impl LoopbackEncoder {
    fn encode_audio(&self, buffer: &AudioBuffer) -> Result<Bytes, CodecError> {
        if let Some(expected) = self.params.frame_size
            && buffer.samples != expected
        {
            return Err(CodecError::Send(format!(
                "frame holds {} samples, encoder needs {}",
                buffer.samples, expected
            )));
        }
        let planes = buffer.to_f32_planes().map_err(CodecError::Send)?;
        let format = AudioFormat::new(buffer.format.sample_rate, buffer.format.channels, SampleFormat::S16);
        let packed = AudioBuffer::from_f32_planes(format, &planes);
        Ok(packed.planes.into_iter().next().unwrap_or_default())
    }
}

impl Encoder for LoopbackEncoder {
    fn send(&mut self, frame: DecodedFrame, keyframe: bool) -> Result<(), CodecError> {
        if frame.kind() != self.params.kind() {
            return Err(CodecError::WrongKind(frame.kind()));
        }
        if self.flushed {
            return Err(CodecError::Send("encoder already flushed".into()));
        }

        let tb = self.params.timebase;
        let pts = frame.pts.map(|pts| frame.timebase.rescale(pts, tb));
        let (data, duration, is_keyframe) = match &frame.data {
            FrameData::Audio(buffer) => {
                let data = self.encode_audio(buffer)?;
                let duration = Rational::per_second(buffer.format.sample_rate)
                    .rescale(buffer.samples as i64, tb);
                (data, duration, true)
            }
            FrameData::Video(buffer) => (buffer.data.clone(), 0, keyframe || self.frames_in == 0),
        };

        self.frames_in += 1;
        self.packets.push_back(MediaPacket {
            kind: frame.kind(),
            data,
            pts,
            dts: pts,
            duration,
            is_keyframe,
            timebase: tb,
        });
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<MediaPacket>, CodecError> {
        if self.flushed || self.packets.len() > self.delay {
            return Ok(self.packets.pop_front());
        }
        Ok(None)
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.flushed = true;
        Ok(())
    }

    fn timebase(&self) -> Rational {
        self.params.timebase
    }

    fn frame_size(&self) -> Option<usize> {
        match self.params.kind() {
            MediaKind::Audio => self.params.frame_size,
            MediaKind::Video => None,
        }
    }
}
