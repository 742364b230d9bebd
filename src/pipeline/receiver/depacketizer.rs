//! RTP depacketizer: jitter buffer in, elementary-stream packets out
//!
//! `push_packet` is called from the network side, `process_pop` from the pop
//! timer; both may run concurrently. Ordered packets leaving the jitter buffer
//! are turned into [`MediaPacket`]s:
//!
//! - Opus payloads are forwarded unchanged, one RTP payload per packet.
//! - H.264 payloads (RFC 6184) are rebuilt into Annex B NAL units: single NAL
//!   units are prefixed with a start code, FU-A fragments are reassembled,
//!   STAP-A aggregates are split.
//!
//! Every emitted packet carries the RTP timestamp (unwrapped to 64 bit) as
//! both pts and dts, in the stream's `1/clock_rate` timebase.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::jitter::{JitterBuffer, JitterStats, PopOutcome, PushOutcome};
use super::rtp::RawRtpPacket;
use crate::config::JitterConfig;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::types::{CodecId, MediaKind, MediaPacket, StreamDescriptor};
use crate::telemetry::SharedTelemetry;
use crate::{emit_debug, emit_info, emit_warn};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_STAP_A: u8 = 24;
pub const NAL_FU_A: u8 = 28;

/// Media duration credited to each packet for jitter-buffer depth accounting.
///
/// The first packet gets the nominal depth. Later packets get the RTP
/// timestamp advance since the newest packet seen, clamped to `max_ms`;
/// packets that share or precede that timestamp get zero.
#[derive(Debug, Clone)]
pub struct PayloadDurationEstimator {
    clock_rate: u32,
    nominal_ms: u32,
    max_ms: u32,
    last_ts: Option<u32>,
}

impl PayloadDurationEstimator {
    pub fn new(clock_rate: u32, config: &JitterConfig) -> Self {
        Self {
            clock_rate: clock_rate.max(1),
            nominal_ms: config.nominal_depth_ms,
            max_ms: config.max_payload_ms,
            last_ts: None,
        }
    }

    pub fn estimate(&mut self, timestamp: u32) -> u32 {
        let Some(last) = self.last_ts else {
            self.last_ts = Some(timestamp);
            return self.nominal_ms;
        };
        let delta = timestamp.wrapping_sub(last);
        if delta == 0 || delta >= 0x8000_0000 {
            return 0;
        }
        self.last_ts = Some(timestamp);
        let ms = delta as u64 * 1000 / self.clock_rate as u64;
        ms.min(self.max_ms as u64) as u32
    }

    pub fn reset(&mut self) {
        self.last_ts = None;
    }
}

/// Extends 32 bit RTP timestamps into a monotonic 64 bit timeline
#[derive(Debug, Clone, Default)]
struct TimestampUnwrapper {
    last: Option<(u32, i64)>,
}

impl TimestampUnwrapper {
    fn unwrap(&mut self, ts: u32) -> i64 {
        let ext = match self.last {
            None => ts as i64,
            Some((last, last_ext)) => last_ext + ts.wrapping_sub(last) as i32 as i64,
        };
        if self.last.is_none_or(|(_, last_ext)| ext > last_ext) {
            self.last = Some((ts, ext));
        }
        ext
    }
}

/// Outcome of feeding one payload to the [`H264Assembler`]
#[derive(Debug, Default, PartialEq)]
pub struct Assembled {
    /// Complete start-code-prefixed NAL units, in order
    pub nals: Vec<Bytes>,
    /// A partially reassembled NAL was thrown away
    pub abandoned: bool,
    /// The payload was not usable
    pub rejected: Option<&'static str>,
}

impl Assembled {
    fn rejected(reason: &'static str) -> Self {
        Self {
            rejected: Some(reason),
            ..Self::default()
        }
    }
}

/// H.264 NAL unit reassembly state
#[derive(Debug, Default)]
pub struct H264Assembler {
    /// Present only while a FU-A train is being rebuilt
    buffer: Option<BytesMut>,
    timestamp: u32,
}

impl H264Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reassembling(&self) -> bool {
        self.buffer.is_some()
    }

    /// Discard any partial NAL. Returns whether one was in progress.
    pub fn reset(&mut self) -> bool {
        self.buffer.take().is_some()
    }

    pub fn push(&mut self, payload: &[u8], timestamp: u32) -> Assembled {
        let Some(&indicator) = payload.first() else {
            return Assembled::rejected("empty payload");
        };

        match indicator & 0x1F {
            1..=23 => Assembled {
                abandoned: self.reset(),
                nals: vec![prefixed(payload)],
                rejected: None,
            },
            NAL_STAP_A => {
                let abandoned = self.reset();
                let mut nals = Vec::new();
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if size == 0 || offset + size > payload.len() {
                        break;
                    }
                    nals.push(prefixed(&payload[offset..offset + size]));
                    offset += size;
                }
                let rejected = nals.is_empty().then_some("STAP-A without NAL units");
                Assembled {
                    nals,
                    abandoned,
                    rejected,
                }
            }
            NAL_FU_A => self.push_fragment(payload, timestamp),
            _ => Assembled::rejected("unsupported NAL unit type"),
        }
    }

    fn push_fragment(&mut self, payload: &[u8], timestamp: u32) -> Assembled {
        if payload.len() < 2 {
            return Assembled::rejected("truncated FU-A header");
        }
        let indicator = payload[0];
        let header = payload[1];
        let start = header & 0x80 != 0;
        let end = header & 0x40 != 0;
        let body = &payload[2..];

        let mut out = Assembled::default();
        if start {
            out.abandoned = self.reset();
            let mut buf = BytesMut::with_capacity(START_CODE.len() + 1 + body.len() * 4);
            buf.put_slice(&START_CODE);
            buf.put_u8((indicator & 0xE0) | (header & 0x1F));
            self.buffer = Some(buf);
            self.timestamp = timestamp;
        } else if self.buffer.is_none() {
            return Assembled::rejected("FU-A continuation without start");
        } else if self.timestamp != timestamp {
            self.reset();
            out.abandoned = true;
            out.rejected = Some("FU-A continuation from another frame");
            return out;
        }

        if let Some(buf) = self.buffer.as_mut() {
            buf.put_slice(body);
        }
        if end && let Some(buf) = self.buffer.take() {
            out.nals.push(buf.freeze());
        }
        out
    }
}

fn prefixed(nal: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(START_CODE.len() + nal.len());
    buf.put_slice(&START_CODE);
    buf.put_slice(nal);
    buf.freeze()
}

/// NAL unit type of a start-code-prefixed unit
pub fn nal_type(unit: &[u8]) -> Option<u8> {
    unit.get(START_CODE.len()).map(|b| b & 0x1F)
}

/// Scan Annex B data for a NAL unit with the given type
pub fn contains_nal_type(data: &[u8], target_type: u8) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if (data[i + 3] & 0x1F) == target_type {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepacketizerStats {
    pub jitter: JitterStats,
    pub packets_emitted: u64,
    pub assembler_resets: u64,
    pub payloads_rejected: u64,
    /// Emitted packets lost because the output queue was cleared
    pub output_drops: u64,
}

struct Intake {
    jitter: JitterBuffer,
    estimator: PayloadDurationEstimator,
}

struct Assembly {
    h264: H264Assembler,
    unwrapper: TimestampUnwrapper,
    stats: DepacketizerStats,
}

pub struct Depacketizer {
    descriptor: StreamDescriptor,
    intake: Mutex<Intake>,
    assembly: Mutex<Assembly>,
    output: Arc<BoundedQueue<MediaPacket>>,
    telemetry: SharedTelemetry,
    health: Arc<PipelineHealth>,
}

impl Depacketizer {
    pub fn new(
        descriptor: StreamDescriptor,
        config: &JitterConfig,
        output: Arc<BoundedQueue<MediaPacket>>,
        telemetry: SharedTelemetry,
    ) -> Self {
        Self {
            descriptor,
            intake: Mutex::new(Intake {
                jitter: JitterBuffer::new(config.clone(), descriptor.clock_rate),
                estimator: PayloadDurationEstimator::new(descriptor.clock_rate, config),
            }),
            assembly: Mutex::new(Assembly {
                h264: H264Assembler::new(),
                unwrapper: TimestampUnwrapper::default(),
                stats: DepacketizerStats::default(),
            }),
            output,
            telemetry,
            health: Arc::new(PipelineHealth::new()),
        }
    }

    pub fn with_health(mut self, health: Arc<PipelineHealth>) -> Self {
        self.health = health;
        self
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn output(&self) -> &Arc<BoundedQueue<MediaPacket>> {
        &self.output
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    fn intake(&self) -> MutexGuard<'_, Intake> {
        self.intake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn assembly(&self) -> MutexGuard<'_, Assembly> {
        self.assembly.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Network-side entry point; safe to call from any thread
    pub fn push_packet(&self, data: impl Into<Bytes>) -> PushOutcome {
        self.push_packet_at(data.into(), Instant::now())
    }

    pub fn push_packet_at(&self, data: Bytes, now: Instant) -> PushOutcome {
        let packet = match RawRtpPacket::parse(data) {
            Ok(packet) => packet,
            Err(err) => {
                self.intake().jitter.record_malformed();
                self.health.record_drop();
                emit_debug!(self.telemetry, "depacketizer", "malformed datagram: {}", err);
                return PushOutcome::Malformed;
            }
        };

        let mut intake = self.intake();
        let duration = intake.estimator.estimate(packet.timestamp());
        let seq = packet.sequence_number();
        let outcome = intake
            .jitter
            .push_at(Arc::new(packet.with_duration_ms(duration)), now);
        drop(intake);

        match outcome {
            PushOutcome::Accepted => {}
            PushOutcome::Duplicate => {
                emit_debug!(self.telemetry, "jitter", "duplicate or late packet seq={}", seq)
            }
            PushOutcome::Overflow => {
                self.health.record_drop();
                emit_warn!(self.telemetry, "jitter", "buffer full, dropped seq={}", seq)
            }
            PushOutcome::Malformed => {
                self.health.record_drop();
                emit_debug!(self.telemetry, "jitter", "empty payload seq={}", seq)
            }
        }
        outcome
    }

    /// Pop until the jitter buffer reports `Buffering` or `Empty`.
    /// Returns the number of packets emitted.
    pub fn process_pop(&self) -> usize {
        self.process_pop_at(Instant::now())
    }

    pub fn process_pop_at(&self, now: Instant) -> usize {
        let mut emitted = 0;
        loop {
            let outcome = self.intake().jitter.pop_at(now);
            match outcome {
                PopOutcome::Ready(packet) => emitted += self.emit(&packet),
                PopOutcome::Dropped { lost } => self.on_loss(lost),
                PopOutcome::Buffering | PopOutcome::Empty => break,
            }
        }
        emitted
    }

    /// Release everything buffered, then drop any partial NAL
    pub fn flush(&self) -> usize {
        let outcomes = self.intake().jitter.flush();
        let mut emitted = 0;
        for outcome in outcomes {
            match outcome {
                PopOutcome::Ready(packet) => emitted += self.emit(&packet),
                PopOutcome::Dropped { lost } => self.on_loss(lost),
                PopOutcome::Buffering | PopOutcome::Empty => {}
            }
        }
        let mut assembly = self.assembly();
        if assembly.h264.reset() {
            assembly.stats.assembler_resets += 1;
        }
        emitted
    }

    /// Forget all buffered and partially assembled data
    pub fn reset(&self) {
        {
            let mut intake = self.intake();
            intake.jitter.reset();
            intake.estimator.reset();
        }
        let mut assembly = self.assembly();
        assembly.h264.reset();
        assembly.unwrapper = TimestampUnwrapper::default();
    }

    pub fn stats(&self) -> DepacketizerStats {
        let jitter = self.intake().jitter.stats();
        DepacketizerStats {
            jitter,
            ..self.assembly().stats.clone()
        }
    }

    fn on_loss(&self, lost: u16) {
        let mut assembly = self.assembly();
        let abandoned = assembly.h264.reset();
        if abandoned {
            assembly.stats.assembler_resets += 1;
            self.health.record_reset();
        }
        drop(assembly);
        emit_info!(
            self.telemetry,
            "depacketizer",
            "{} packet(s) lost{}",
            lost,
            if abandoned { ", partial NAL discarded" } else { "" }
        );
    }

    fn emit(&self, packet: &RawRtpPacket) -> usize {
        let timebase = self.descriptor.rtp_timebase();
        let packets: Vec<MediaPacket> = {
            let mut assembly = self.assembly();
            let ts = assembly.unwrapper.unwrap(packet.timestamp());
            match self.descriptor.codec {
                CodecId::H264 => {
                    let out = assembly.h264.push(&packet.payload(), packet.timestamp());
                    if out.abandoned {
                        assembly.stats.assembler_resets += 1;
                        self.health.record_reset();
                        emit_info!(
                            self.telemetry,
                            "depacketizer",
                            "partial NAL abandoned at seq={}",
                            packet.sequence_number()
                        );
                    }
                    if let Some(reason) = out.rejected {
                        assembly.stats.payloads_rejected += 1;
                        self.health.record_drop();
                        emit_debug!(
                            self.telemetry,
                            "depacketizer",
                            "dropped seq={}: {}",
                            packet.sequence_number(),
                            reason
                        );
                    }
                    out.nals
                        .into_iter()
                        .map(|nal| {
                            let key = nal_type(&nal) == Some(NAL_IDR);
                            MediaPacket::new(MediaKind::Video, nal, ts, timebase).keyframe(key)
                        })
                        .collect()
                }
                CodecId::Opus | CodecId::Aac => {
                    vec![MediaPacket::new(MediaKind::Audio, packet.payload(), ts, timebase).keyframe(true)]
                }
            }
        };

        let mut emitted = 0;
        for media in packets {
            let (size, key) = (media.size(), media.is_keyframe);
            if self.output.enqueue(media) {
                emitted += 1;
                self.health.record_item(size, key);
            } else {
                self.assembly().stats.output_drops += 1;
            }
        }
        self.assembly().stats.packets_emitted += emitted as u64;
        emitted
    }
}
