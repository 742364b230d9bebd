//! FFmpeg-backed codec service (feature `ffmpeg`)

use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioDecoder, AudioEncoder, AudioFrame, AudioFrameMut, ChannelLayout};
use ac_ffmpeg::codec::video::{self, VideoDecoder, VideoEncoder, VideoFrame, VideoFrameMut};
use ac_ffmpeg::codec::{Decoder as _, Encoder as _};
use ac_ffmpeg::packet::{Packet, PacketMut};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use bytes::Bytes;
use std::collections::VecDeque;

use super::{CodecParams, CodecService, Decoder, Encoder};
use crate::error::CodecError;
use crate::telemetry::{SharedTelemetry, Telemetry, default_telemetry};
use crate::{emit_debug, emit_info, emit_warn};
use crate::pipeline::types::{
    AudioBuffer, AudioFormat, CodecId, DecodedFrame, FrameData, MediaKind, MediaPacket,
    PixelFormat, Rational, SampleFormat, VideoBuffer,
};

/// Hardware encoders first, software last
const ENCODER_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "h264_nvenc",
        &[
            ("preset", "p2"),
            ("tune", "ll"),
            ("zerolatency", "1"),
            ("rc", "vbr"),
            ("g", "60"),
            ("delay", "0"),
            ("forced-idr", "1"),
        ],
    ),
    ("h264_qsv", &[("preset", "fast"), ("g", "60"), ("async_depth", "4")]),
    ("h264_amf", &[("usage", "lowlatency"), ("quality", "balanced"), ("g", "60")]),
    (
        "libx264",
        &[
            ("preset", "ultrafast"),
            ("tune", "zerolatency"),
            ("g", "60"),
            ("forced-idr", "1"),
        ],
    ),
];

fn tb(r: Rational) -> TimeBase {
    TimeBase::new(r.num, r.den)
}

fn ts_value(ts: Timestamp, to: Rational) -> Option<i64> {
    if ts.is_null() {
        None
    } else {
        Some(ts.with_time_base(tb(to)).timestamp())
    }
}

fn decoder_names(codec: CodecId) -> &'static [&'static str] {
    match codec {
        CodecId::H264 => &["h264"],
        CodecId::Opus => &["libopus", "opus"],
        CodecId::Aac => &["aac"],
    }
}

fn sample_format_name(format: SampleFormat) -> &'static str {
    match format {
        SampleFormat::S16 => "s16",
        SampleFormat::S16Planar => "s16p",
        SampleFormat::F32 => "flt",
        SampleFormat::F32Planar => "fltp",
    }
}

fn sample_format_from_name(name: &str) -> Option<SampleFormat> {
    match name {
        "s16" => Some(SampleFormat::S16),
        "s16p" => Some(SampleFormat::S16Planar),
        "flt" => Some(SampleFormat::F32),
        "fltp" => Some(SampleFormat::F32Planar),
        _ => None,
    }
}

fn pixel_format_name(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Yuv420p => "yuv420p",
        PixelFormat::Nv12 => "nv12",
        PixelFormat::Bgra => "bgra",
    }
}

const COMPONENT: &str = "ffmpeg";

/// Codec service over the system FFmpeg libraries
#[derive(Clone)]
pub struct FfmpegCodec {
    telemetry: SharedTelemetry,
}

impl FfmpegCodec {
    pub fn new(telemetry: SharedTelemetry) -> Self {
        Self { telemetry }
    }
}

impl Default for FfmpegCodec {
    fn default() -> Self {
        Self::new(default_telemetry())
    }
}

impl CodecService for FfmpegCodec {
    fn open_decoder(&self, params: &CodecParams) -> Result<Box<dyn Decoder>, CodecError> {
        let inner = match params.kind() {
            MediaKind::Video => {
                let decoder = VideoDecoder::builder("h264")
                    .and_then(|b| b.time_base(tb(params.timebase)).build())
                    .map_err(|e| CodecError::Open(e.to_string()))?;
                DecoderInner::Video(decoder)
            }
            MediaKind::Audio => {
                let mut last = None;
                let mut opened = None;
                for name in decoder_names(params.codec) {
                    match AudioDecoder::new(name) {
                        Ok(decoder) => {
                            opened = Some(decoder);
                            break;
                        }
                        Err(e) => {
                            emit_warn!(self.telemetry, COMPONENT, "{} decoder not available ({})", name, e);
                            last = Some(e.to_string());
                        }
                    }
                }
                let decoder = opened.ok_or_else(|| {
                    CodecError::Unavailable(last.unwrap_or_else(|| params.codec.to_string()))
                })?;
                DecoderInner::Audio(decoder)
            }
        };
        Ok(Box::new(FfmpegDecoder {
            inner,
            timebase: params.timebase,
            pending: VecDeque::new(),
        }))
    }

    fn open_encoder(&self, params: &CodecParams) -> Result<Box<dyn Encoder>, CodecError> {
        match params.kind() {
            MediaKind::Video => open_video_encoder(params, &*self.telemetry),
            MediaKind::Audio => open_audio_encoder(params),
        }
    }
}

enum DecoderInner {
    Video(VideoDecoder),
    Audio(AudioDecoder),
}

struct FfmpegDecoder {
    inner: DecoderInner,
    timebase: Rational,
    pending: VecDeque<DecodedFrame>,
}

// The decoder is only ever used from the thread that currently owns it
unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    fn try_push(&mut self, packet: Packet) -> Result<(), ac_ffmpeg::Error> {
        match &mut self.inner {
            DecoderInner::Video(d) => d.try_push(packet),
            DecoderInner::Audio(d) => d.try_push(packet),
        }
    }

    fn take(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        let timebase = self.timebase;
        match &mut self.inner {
            DecoderInner::Video(d) => match d.take() {
                Ok(Some(frame)) => Ok(Some(video_frame(&frame, timebase))),
                Ok(None) => Ok(None),
                Err(e) => Err(CodecError::Receive(e.to_string())),
            },
            DecoderInner::Audio(d) => match d.take() {
                Ok(Some(frame)) => audio_frame(&frame, timebase).map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(CodecError::Receive(e.to_string())),
            },
        }
    }

    fn kind(&self) -> MediaKind {
        match self.inner {
            DecoderInner::Video(_) => MediaKind::Video,
            DecoderInner::Audio(_) => MediaKind::Audio,
        }
    }
}

impl Decoder for FfmpegDecoder {
    fn send(&mut self, packet: MediaPacket) -> Result<(), CodecError> {
        if packet.kind != self.kind() {
            return Err(CodecError::WrongKind(packet.kind));
        }
        let build = |p: &MediaPacket| {
            let mut out = PacketMut::from(&p.data[..]);
            if let Some(pts) = p.pts {
                out = out.with_pts(Timestamp::new(pts, tb(p.timebase)));
            }
            if let Some(dts) = p.dts {
                out = out.with_dts(Timestamp::new(dts, tb(p.timebase)));
            }
            out.freeze()
        };

        match self.try_push(build(&packet)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_again() => {
                // Output is full: park ready frames and retry once
                while let Some(frame) = self.take()? {
                    self.pending.push_back(frame);
                }
                self.try_push(build(&packet))
                    .map_err(|e| CodecError::Send(e.to_string()))
            }
            Err(e) => Err(CodecError::Send(e.to_string())),
        }
    }

    fn receive(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        self.take()
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        let res = match &mut self.inner {
            DecoderInner::Video(d) => d.flush(),
            DecoderInner::Audio(d) => d.flush(),
        };
        res.map_err(|e| CodecError::Send(e.to_string()))
    }
}

fn audio_frame(frame: &AudioFrame, timebase: Rational) -> Result<DecodedFrame, CodecError> {
    let name = frame.sample_format().name();
    let sample_format = sample_format_from_name(name)
        .ok_or_else(|| CodecError::Receive(format!("unsupported sample format {}", name)))?;
    let channels = frame.channel_layout().channels() as u16;
    let samples = frame.samples();
    let plane_len = if sample_format.is_planar() {
        samples * sample_format.bytes_per_sample()
    } else {
        samples * sample_format.bytes_per_sample() * channels as usize
    };

    let planes = frame
        .planes()
        .iter()
        .map(|p| {
            let data = p.data();
            Bytes::copy_from_slice(&data[..plane_len.min(data.len())])
        })
        .collect();
    let buffer = AudioBuffer {
        format: AudioFormat::new(frame.sample_rate(), channels, sample_format),
        samples,
        planes,
    };
    buffer.validate().map_err(CodecError::Receive)?;
    Ok(DecodedFrame::audio(buffer, ts_value(frame.pts(), timebase), timebase))
}

/// Copy a decoded picture into a tightly packed yuv420p buffer
fn video_frame(frame: &VideoFrame, timebase: Rational) -> DecodedFrame {
    let (w, h) = (frame.width(), frame.height());
    let planes = frame.planes();
    let mut out = Vec::with_capacity(w * h + (w / 2) * (h / 2) * 2);
    for (i, (pw, ph)) in [(w, h), (w / 2, h / 2), (w / 2, h / 2)].into_iter().enumerate() {
        let Some(plane) = planes.get(i) else { break };
        let stride = plane.line_size();
        let data = plane.data();
        for row in 0..ph {
            let start = row * stride;
            if let Some(line) = data.get(start..start + pw) {
                out.extend_from_slice(line);
            }
        }
    }
    let buffer = VideoBuffer {
        width: w as u32,
        height: h as u32,
        pixel_format: PixelFormat::Yuv420p,
        data: Bytes::from(out),
    };
    DecodedFrame::video(buffer, ts_value(frame.pts(), timebase), timebase)
}

fn open_video_encoder(params: &CodecParams, telemetry: &dyn Telemetry) -> Result<Box<dyn Encoder>, CodecError> {
    let width = params.width.unwrap_or(0) as usize;
    let height = params.height.unwrap_or(0) as usize;
    if width == 0 || height == 0 {
        return Err(CodecError::Open("video encoder needs dimensions".into()));
    }
    // Chroma subsampling needs even dimensions
    let w = width + width % 2;
    let h = height + height % 2;
    let pixel_format = video::frame::get_pixel_format("yuv420p");
    let time_base = tb(params.timebase);

    for (codec, options) in ENCODER_CHAIN {
        let mut builder = match VideoEncoder::builder(codec) {
            Ok(b) => b,
            Err(e) => {
                emit_debug!(telemetry, COMPONENT, "encoder {} not available, skipping: {}", codec, e);
                continue;
            }
        };
        builder = builder
            .pixel_format(pixel_format)
            .width(w)
            .height(h)
            .time_base(time_base);
        for (k, v) in *options {
            builder = builder.set_option(k, v);
        }
        if let Some(bitrate) = params.bitrate {
            builder = builder.set_option("b", bitrate.to_string());
        }
        match builder.build() {
            Ok(encoder) => {
                emit_info!(telemetry, COMPONENT, "using encoder {}", codec);
                return Ok(Box::new(FfmpegEncoder {
                    inner: EncoderInner::Video {
                        encoder,
                        pixel_format,
                        width: w,
                        height: h,
                    },
                    timebase: params.timebase,
                    frame_size: None,
                    sample_rate: 0,
                }));
            }
            Err(e) => emit_debug!(telemetry, COMPONENT, "encoder {} failed to initialize: {}", codec, e),
        }
    }
    Err(CodecError::Unavailable("no H.264 encoder available".into()))
}

fn open_audio_encoder(params: &CodecParams) -> Result<Box<dyn Encoder>, CodecError> {
    let name = match params.codec {
        CodecId::Opus => "libopus",
        CodecId::Aac => "aac",
        CodecId::H264 => return Err(CodecError::WrongKind(MediaKind::Video)),
    };
    let sample_rate = params.sample_rate.unwrap_or(48_000);
    let channels = params.channels.unwrap_or(1) as u32;
    let layout = ChannelLayout::from_channels(channels)
        .ok_or_else(|| CodecError::Open(format!("no layout for {} channels", channels)))?;

    let mut builder = AudioEncoder::builder(name)
        .map_err(|e| CodecError::Unavailable(e.to_string()))?
        .sample_rate(sample_rate)
        .channel_layout(layout)
        .sample_format(get_sample_format(sample_format_name(SampleFormat::F32)))
        .time_base(tb(params.timebase));
    if let Some(bitrate) = params.bitrate {
        builder = builder.bit_rate(bitrate);
    }
    let encoder = builder.build().map_err(|e| CodecError::Open(e.to_string()))?;
    let frame_size = encoder.samples_per_frame().or(params.frame_size);

    Ok(Box::new(FfmpegEncoder {
        inner: EncoderInner::Audio(encoder),
        timebase: params.timebase,
        frame_size,
        sample_rate,
    }))
}

enum EncoderInner {
    Video {
        encoder: VideoEncoder,
        pixel_format: video::frame::PixelFormat,
        width: usize,
        height: usize,
    },
    Audio(AudioEncoder),
}

struct FfmpegEncoder {
    inner: EncoderInner,
    timebase: Rational,
    frame_size: Option<usize>,
    sample_rate: u32,
}

// The encoder is only ever used from the thread that currently owns it
unsafe impl Send for FfmpegEncoder {}

impl Encoder for FfmpegEncoder {
    fn send(&mut self, frame: DecodedFrame, keyframe: bool) -> Result<(), CodecError> {
        let time_base = tb(self.timebase);
        let pts = frame
            .pts
            .map(|pts| frame.timebase.rescale(pts, self.timebase))
            .map(|pts| Timestamp::new(pts, time_base));

        match (&mut self.inner, &frame.data) {
            (EncoderInner::Video { encoder, pixel_format, width, height }, FrameData::Video(buffer)) => {
                if pixel_format_name(buffer.pixel_format) != "yuv420p" {
                    return Err(CodecError::Send(format!(
                        "unsupported pixel format {:?}",
                        buffer.pixel_format
                    )));
                }
                let mut out = VideoFrameMut::black(*pixel_format, *width, *height)
                    .with_time_base(time_base)
                    .with_picture_type(if keyframe {
                        video::frame::PictureType::I
                    } else {
                        video::frame::PictureType::None
                    });
                if let Some(pts) = pts {
                    out = out.with_pts(pts);
                }
                write_yuv420(&mut out, buffer);
                encoder.push(out.freeze()).map_err(|e| CodecError::Send(e.to_string()))
            }
            (EncoderInner::Audio(encoder), FrameData::Audio(buffer)) => {
                let planes = buffer.to_f32_planes().map_err(CodecError::Send)?;
                let format = AudioFormat::new(buffer.format.sample_rate, buffer.format.channels, SampleFormat::F32);
                let packed = AudioBuffer::from_f32_planes(format, &planes);

                let params = encoder.codec_parameters();
                let mut out = AudioFrameMut::silence(
                    params.channel_layout(),
                    params.sample_format(),
                    params.sample_rate(),
                    packed.samples,
                )
                .with_time_base(time_base);
                if let Some(pts) = pts {
                    out = out.with_pts(pts);
                }
                if let (Some(dst), Some(src)) = (out.planes_mut().first_mut(), packed.planes.first()) {
                    let data = dst.data_mut();
                    let n = data.len().min(src.len());
                    data[..n].copy_from_slice(&src[..n]);
                }
                encoder.push(out.freeze()).map_err(|e| CodecError::Send(e.to_string()))
            }
            (_, _) => Err(CodecError::WrongKind(frame.kind())),
        }
    }

    fn receive(&mut self) -> Result<Option<MediaPacket>, CodecError> {
        let (kind, taken) = match &mut self.inner {
            EncoderInner::Video { encoder, .. } => (MediaKind::Video, encoder.take()),
            EncoderInner::Audio(encoder) => (MediaKind::Audio, encoder.take()),
        };
        let Some(packet) = taken.map_err(|e| CodecError::Receive(e.to_string()))? else {
            return Ok(None);
        };

        let pts = ts_value(packet.pts(), self.timebase);
        let dts = ts_value(packet.dts(), self.timebase).or(pts);
        let duration = match (kind, self.frame_size) {
            (MediaKind::Audio, Some(samples)) if self.sample_rate > 0 => {
                Rational::per_second(self.sample_rate).rescale(samples as i64, self.timebase)
            }
            _ => 0,
        };
        Ok(Some(MediaPacket {
            kind,
            data: Bytes::copy_from_slice(packet.data()),
            pts,
            dts,
            duration,
            is_keyframe: kind == MediaKind::Audio || packet.is_key(),
            timebase: self.timebase,
        }))
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        let res = match &mut self.inner {
            EncoderInner::Video { encoder, .. } => encoder.flush(),
            EncoderInner::Audio(encoder) => encoder.flush(),
        };
        res.map_err(|e| CodecError::Send(e.to_string()))
    }

    fn timebase(&self) -> Rational {
        self.timebase
    }

    fn frame_size(&self) -> Option<usize> {
        self.frame_size
    }
}

fn write_yuv420(frame: &mut VideoFrameMut, buffer: &VideoBuffer) {
    let (w, h) = (buffer.width as usize, buffer.height as usize);
    let src = &buffer.data[..];
    let mut offset = 0;
    let mut planes = frame.planes_mut();
    for (i, (pw, ph)) in [(w, h), (w / 2, h / 2), (w / 2, h / 2)].into_iter().enumerate() {
        let Some(plane) = planes.get_mut(i) else { break };
        let stride = plane.line_size();
        let dst = plane.data_mut();
        for row in 0..ph {
            let (Some(from), Some(to)) = (
                src.get(offset..offset + pw),
                dst.get_mut(row * stride..row * stride + pw),
            ) else {
                return;
            };
            to.copy_from_slice(from);
            offset += pw;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryTelemetry;
    use std::sync::Arc;

    #[test]
    fn test_encoder_selection_reports_to_telemetry() {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let codec = FfmpegCodec::new(telemetry.clone());
        let params = CodecParams::video_encoder(CodecId::H264, 64, 64, Rational::new(1, 30));

        // every candidate is either skipped or chosen, and each says so
        match codec.open_encoder(&params) {
            Ok(_) => assert!(telemetry.contains("using encoder")),
            Err(err) => {
                assert!(matches!(err, CodecError::Unavailable(_)));
                assert!(telemetry.contains("encoder"));
            }
        }
        assert!(telemetry.events().iter().all(|e| e.component == COMPONENT));
    }

    #[test]
    fn test_video_encoder_needs_dimensions() {
        let codec = FfmpegCodec::new(Arc::new(MemoryTelemetry::new()));
        let mut params = CodecParams::video_encoder(CodecId::H264, 64, 64, Rational::new(1, 30));
        params.width = None;
        assert!(matches!(codec.open_encoder(&params), Err(CodecError::Open(_))));
    }
}
