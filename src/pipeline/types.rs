//! Core types for the pipeline system

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rational seconds-per-tick value used as a stream timebase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// `1 / rate`, the natural timebase of a clock running at `rate` Hz
    pub const fn per_second(rate: u32) -> Self {
        Self {
            num: 1,
            den: rate as i32,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Convert `value` expressed in `self` into the equivalent value in `to`.
    ///
    /// Rounds to the nearest tick, halfway cases away from zero, and
    /// saturates at the `i64` range.
    pub fn rescale(self, value: i64, to: Rational) -> i64 {
        let num = value as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        if den == 0 {
            return if num >= 0 { i64::MAX } else { i64::MIN };
        }
        let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
        let half = den / 2;
        let q = if num >= 0 {
            (num + half) / den
        } else {
            -((-num + half) / den)
        };
        q.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Elementary-stream codec carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    H264,
    Opus,
    Aac,
}

impl CodecId {
    pub fn kind(&self) -> MediaKind {
        match self {
            CodecId::H264 => MediaKind::Video,
            CodecId::Opus | CodecId::Aac => MediaKind::Audio,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecId::H264 => write!(f, "h264"),
            CodecId::Opus => write!(f, "opus"),
            CodecId::Aac => write!(f, "aac"),
        }
    }
}

/// Stream parameters produced by session negotiation
///
/// Consumed once when a pipeline is built: the clock rate parameterizes the
/// jitter buffer, the rest is handed to the codec service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub codec: CodecId,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl StreamDescriptor {
    pub fn h264() -> Self {
        Self {
            codec: CodecId::H264,
            clock_rate: 90_000,
            sample_rate: None,
            channels: None,
            width: None,
            height: None,
        }
    }

    pub fn opus(sample_rate: u32, channels: u16) -> Self {
        Self {
            codec: CodecId::Opus,
            clock_rate: 48_000,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            width: None,
            height: None,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }

    /// Timebase of timestamps taken straight from RTP headers
    pub fn rtp_timebase(&self) -> Rational {
        Rational::per_second(self.clock_rate)
    }
}

/// Encoded elementary-stream packet
///
/// Ownership moves from queue to stage to queue; a packet is never shared
/// between two stages.
#[derive(Clone)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub data: Bytes,
    /// Presentation timestamp in `timebase`; `None` when unknown
    pub pts: Option<i64>,
    /// Decode timestamp in `timebase`; `None` when unknown
    pub dts: Option<i64>,
    /// Duration in `timebase` ticks, 0 when unknown
    pub duration: i64,
    pub is_keyframe: bool,
    pub timebase: Rational,
}

impl MediaPacket {
    /// Create a packet whose pts and dts are both `ts`
    pub fn new(kind: MediaKind, data: Bytes, ts: i64, timebase: Rational) -> Self {
        Self {
            kind,
            data,
            pts: Some(ts),
            dts: Some(ts),
            duration: 0,
            is_keyframe: false,
            timebase,
        }
    }

    pub fn keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for MediaPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPacket")
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("is_keyframe", &self.is_keyframe)
            .field("timebase", &self.timebase)
            .field("size", &self.size())
            .finish()
    }
}

/// Layout and encoding of audio samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Interleaved signed 16 bit
    S16,
    /// One plane of signed 16 bit per channel
    S16Planar,
    /// Interleaved 32 bit float
    F32,
    /// One plane of 32 bit float per channel
    F32Planar,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 | SampleFormat::S16Planar => 2,
            SampleFormat::F32 | SampleFormat::F32Planar => 4,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(self, SampleFormat::S16Planar | SampleFormat::F32Planar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {:?}",
            self.sample_rate, self.channels, self.sample_format
        )
    }
}

/// Raw audio samples in native byte order
///
/// Interleaved formats use a single plane; planar formats one plane per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub format: AudioFormat,
    /// Samples per channel
    pub samples: usize,
    pub planes: Vec<Bytes>,
}

impl AudioBuffer {
    /// Pack per-channel float samples into `format`
    pub fn from_f32_planes(format: AudioFormat, planes: &[Vec<f32>]) -> Self {
        let samples = planes.first().map(Vec::len).unwrap_or(0);
        let channels = planes.len();
        let sample_bytes = format.sample_format.bytes_per_sample();

        let planes = if format.sample_format.is_planar() {
            planes
                .iter()
                .map(|plane| {
                    let mut out = Vec::with_capacity(plane.len() * sample_bytes);
                    for &s in plane {
                        push_sample(&mut out, format.sample_format, s);
                    }
                    Bytes::from(out)
                })
                .collect()
        } else {
            let mut out = Vec::with_capacity(samples * channels * sample_bytes);
            for i in 0..samples {
                for plane in planes {
                    push_sample(&mut out, format.sample_format, plane.get(i).copied().unwrap_or(0.0));
                }
            }
            vec![Bytes::from(out)]
        };

        Self {
            format,
            samples,
            planes,
        }
    }

    pub fn from_f32_interleaved(sample_rate: u32, channels: u16, data: &[f32]) -> Self {
        let format = AudioFormat::new(sample_rate, channels, SampleFormat::F32);
        let mut out = Vec::with_capacity(data.len() * 4);
        for &s in data {
            out.extend_from_slice(&s.to_ne_bytes());
        }
        Self {
            format,
            samples: data.len() / channels.max(1) as usize,
            planes: vec![Bytes::from(out)],
        }
    }

    pub fn from_s16_interleaved(sample_rate: u32, channels: u16, data: &[i16]) -> Self {
        let format = AudioFormat::new(sample_rate, channels, SampleFormat::S16);
        let mut out = Vec::with_capacity(data.len() * 2);
        for &s in data {
            out.extend_from_slice(&s.to_ne_bytes());
        }
        Self {
            format,
            samples: data.len() / channels.max(1) as usize,
            planes: vec![Bytes::from(out)],
        }
    }

    pub fn silence(format: AudioFormat, samples: usize) -> Self {
        let planes = vec![vec![0.0f32; samples]; format.channels as usize];
        Self::from_f32_planes(format, &planes)
    }

    /// Check that the planes hold exactly `samples` samples of every channel
    pub fn validate(&self) -> Result<(), String> {
        let channels = self.format.channels as usize;
        if channels == 0 {
            return Err("zero channels".into());
        }
        if self.format.sample_rate == 0 {
            return Err("zero sample rate".into());
        }
        let sample_bytes = self.format.sample_format.bytes_per_sample();
        let (expected_planes, plane_len) = if self.format.sample_format.is_planar() {
            (channels, self.samples * sample_bytes)
        } else {
            (1, self.samples * channels * sample_bytes)
        };
        if self.planes.len() != expected_planes {
            return Err(format!(
                "expected {} planes, got {}",
                expected_planes,
                self.planes.len()
            ));
        }
        if let Some(bad) = self.planes.iter().find(|p| p.len() < plane_len) {
            return Err(format!("plane holds {} bytes, need {}", bad.len(), plane_len));
        }
        Ok(())
    }

    /// Unpack into one float vector per channel
    pub fn to_f32_planes(&self) -> Result<Vec<Vec<f32>>, String> {
        self.validate()?;
        let channels = self.format.channels as usize;
        let fmt = self.format.sample_format;
        let sample_bytes = fmt.bytes_per_sample();

        if fmt.is_planar() {
            Ok(self
                .planes
                .iter()
                .map(|plane| {
                    plane[..self.samples * sample_bytes]
                        .chunks_exact(sample_bytes)
                        .map(|c| read_sample(fmt, c))
                        .collect()
                })
                .collect())
        } else {
            let mut out = vec![Vec::with_capacity(self.samples); channels];
            let frame_bytes = sample_bytes * channels;
            for frame in self.planes[0][..self.samples * frame_bytes].chunks_exact(frame_bytes) {
                for (ch, c) in frame.chunks_exact(sample_bytes).enumerate() {
                    out[ch].push(read_sample(fmt, c));
                }
            }
            Ok(out)
        }
    }
}

fn push_sample(out: &mut Vec<u8>, fmt: SampleFormat, s: f32) {
    match fmt {
        SampleFormat::S16 | SampleFormat::S16Planar => {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            out.extend_from_slice(&v.to_ne_bytes());
        }
        SampleFormat::F32 | SampleFormat::F32Planar => out.extend_from_slice(&s.to_ne_bytes()),
    }
}

fn read_sample(fmt: SampleFormat, c: &[u8]) -> f32 {
    match fmt {
        SampleFormat::S16 | SampleFormat::S16Planar => {
            i16::from_ne_bytes([c[0], c[1]]) as f32 / i16::MAX as f32
        }
        SampleFormat::F32 | SampleFormat::F32Planar => f32::from_ne_bytes([c[0], c[1], c[2], c[3]]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Bgra,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoBuffer {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    Audio(AudioBuffer),
    Video(VideoBuffer),
}

/// Decoded frame travelling between the codec service and the sender stages
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Presentation timestamp in `timebase`; `None` when unknown
    pub pts: Option<i64>,
    pub timebase: Rational,
    pub data: FrameData,
}

impl DecodedFrame {
    pub fn audio(buffer: AudioBuffer, pts: Option<i64>, timebase: Rational) -> Self {
        Self {
            pts,
            timebase,
            data: FrameData::Audio(buffer),
        }
    }

    pub fn video(buffer: VideoBuffer, pts: Option<i64>, timebase: Rational) -> Self {
        Self {
            pts,
            timebase,
            data: FrameData::Video(buffer),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self.data {
            FrameData::Audio(_) => MediaKind::Audio,
            FrameData::Video(_) => MediaKind::Video,
        }
    }

    /// Samples per channel for audio frames, 0 for video
    pub fn sample_count(&self) -> usize {
        match &self.data {
            FrameData::Audio(a) => a.samples,
            FrameData::Video(_) => 0,
        }
    }
}
