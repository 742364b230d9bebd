//! Codec service seam
//!
//! The pipeline never touches codec internals. Stages open a codec through a
//! [`CodecService`] and then only use the `send` / `receive` / `flush`
//! contract. Handles are boxed trait objects that release their native
//! resources on drop.

pub mod loopback;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use crate::config::AudioConfig;
use crate::error::CodecError;
use crate::pipeline::types::{
    CodecId, DecodedFrame, MediaKind, MediaPacket, Rational, SampleFormat, StreamDescriptor,
};

pub use loopback::LoopbackCodec;

/// Parameters handed to `open_decoder` / `open_encoder`
#[derive(Debug, Clone, PartialEq)]
pub struct CodecParams {
    pub codec: CodecId,
    /// Timebase of the timestamps going in (decoder) or coming out (encoder)
    pub timebase: Rational,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub sample_format: Option<SampleFormat>,
    /// Samples per channel per encoder frame
    pub frame_size: Option<usize>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
}

impl CodecParams {
    /// Decoder parameters for a negotiated stream
    pub fn for_stream(descriptor: &StreamDescriptor) -> Self {
        Self {
            codec: descriptor.codec,
            timebase: descriptor.rtp_timebase(),
            sample_rate: descriptor.sample_rate,
            channels: descriptor.channels,
            sample_format: None,
            frame_size: None,
            width: descriptor.width,
            height: descriptor.height,
            bitrate: None,
        }
    }

    /// Encoder parameters matching the working audio format
    pub fn audio_encoder(codec: CodecId, audio: &AudioConfig) -> Self {
        Self {
            codec,
            timebase: audio.timebase,
            sample_rate: Some(audio.sample_rate),
            channels: Some(audio.channels),
            sample_format: Some(audio.sample_format),
            frame_size: Some(audio.frame_size),
            width: None,
            height: None,
            bitrate: None,
        }
    }

    pub fn video_encoder(codec: CodecId, width: u32, height: u32, timebase: Rational) -> Self {
        Self {
            codec,
            timebase,
            sample_rate: None,
            channels: None,
            sample_format: None,
            frame_size: None,
            width: Some(width),
            height: Some(height),
            bitrate: None,
        }
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }
}

/// Open decoder handle
pub trait Decoder: Send {
    fn send(&mut self, packet: MediaPacket) -> Result<(), CodecError>;

    /// Next decoded frame, `None` when the decoder needs more input
    fn receive(&mut self) -> Result<Option<DecodedFrame>, CodecError>;

    /// Signal end of stream; remaining frames are then returned by `receive`
    fn flush(&mut self) -> Result<(), CodecError>;
}

/// Open encoder handle
pub trait Encoder: Send {
    /// Queue a frame; `keyframe` asks for an intra frame
    fn send(&mut self, frame: DecodedFrame, keyframe: bool) -> Result<(), CodecError>;

    /// Next encoded packet, `None` when the encoder needs more input
    fn receive(&mut self) -> Result<Option<MediaPacket>, CodecError>;

    /// Signal end of stream; trailing packets are then returned by `receive`
    fn flush(&mut self) -> Result<(), CodecError>;

    /// Timebase of the timestamps of produced packets
    fn timebase(&self) -> Rational;

    /// Samples per channel the encoder requires per frame, for audio encoders
    fn frame_size(&self) -> Option<usize>;
}

pub trait CodecService: Send + Sync {
    fn open_decoder(&self, params: &CodecParams) -> Result<Box<dyn Decoder>, CodecError>;

    fn open_encoder(&self, params: &CodecParams) -> Result<Box<dyn Encoder>, CodecError>;
}
