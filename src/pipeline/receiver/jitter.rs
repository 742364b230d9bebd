//! Sequence-ordered jitter buffer for inbound RTP
//!
//! Packets are keyed by an extended (unwrapped) sequence number, so the
//! 16 bit wraparound never reorders them. The buffer releases packets strictly
//! in ascending order and only once the buffered media duration reaches the
//! target depth. A hole in the sequence is waited for until the loss timeout
//! (or the maximum depth) is reached; the buffer then reports `Dropped`,
//! skips the hole and never delivers a packet from it afterwards.
//!
//! Every operation has an `_at` variant that takes the current instant, which
//! keeps the loss decision deterministic under test.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::rtp::{RawRtpPacket, seq_delta};
use crate::config::JitterConfig;

/// Result of offering a packet to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Already buffered, or older than the last released packet
    Duplicate,
    /// Buffer is at its packet or depth limit; the packet was discarded
    Overflow,
    /// The packet carries no payload
    Malformed,
}

/// Result of one pop attempt
#[derive(Debug, Clone, PartialEq)]
pub enum PopOutcome {
    /// The next packet in sequence order
    Ready(Arc<RawRtpPacket>),
    /// Buffered depth is below target, or a missing packet is still awaited
    Buffering,
    /// `lost` sequence numbers were skipped; dependent reassembly must reset
    Dropped { lost: u16 },
    /// Nothing is buffered
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterStats {
    pub received: u64,
    pub released: u64,
    pub duplicates: u64,
    pub lost: u64,
    pub overflows: u64,
    pub malformed: u64,
    pub buffered_packets: usize,
    pub depth_ms: u64,
    pub jitter_ms: f64,
    pub target_depth_ms: u32,
}

struct Slot {
    packet: Arc<RawRtpPacket>,
    arrival: Instant,
}

/// RFC 3550 interarrival jitter, in RTP timestamp units
#[derive(Default)]
struct JitterEstimator {
    epoch: Option<Instant>,
    last: Option<(f64, u32)>,
    jitter: f64,
}

impl JitterEstimator {
    fn update(&mut self, arrival: Instant, timestamp: u32, clock_rate: u32) {
        let epoch = *self.epoch.get_or_insert(arrival);
        let arrival_ticks = arrival.saturating_duration_since(epoch).as_secs_f64() * clock_rate as f64;
        if let Some((last_arrival, last_ts)) = self.last {
            let d = (arrival_ticks - last_arrival) - timestamp.wrapping_sub(last_ts) as i32 as f64;
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last = Some((arrival_ticks, timestamp));
    }

    fn jitter_ms(&self, clock_rate: u32) -> f64 {
        if clock_rate == 0 {
            return 0.0;
        }
        self.jitter * 1000.0 / clock_rate as f64
    }
}

pub struct JitterBuffer {
    config: JitterConfig,
    clock_rate: u32,
    packets: BTreeMap<i64, Slot>,
    /// Extended sequence number of the newest packet seen
    highest: Option<i64>,
    last_released: Option<i64>,
    depth_ms: u64,
    estimator: JitterEstimator,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig, clock_rate: u32) -> Self {
        Self {
            config,
            clock_rate,
            packets: BTreeMap::new(),
            highest: None,
            last_released: None,
            depth_ms: 0,
            estimator: JitterEstimator::default(),
            stats: JitterStats::default(),
        }
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn extend(&self, seq: u16) -> i64 {
        match self.highest {
            // offset the first packet so a few reordered predecessors stay positive
            None => seq as i64 + (1 << 16),
            Some(highest) => highest + seq_delta(seq, highest as u16) as i64,
        }
    }

    pub fn push(&mut self, packet: Arc<RawRtpPacket>) -> PushOutcome {
        self.push_at(packet, Instant::now())
    }

    pub fn push_at(&mut self, packet: Arc<RawRtpPacket>, now: Instant) -> PushOutcome {
        self.stats.received += 1;

        if packet.payload().is_empty() {
            self.stats.malformed += 1;
            return PushOutcome::Malformed;
        }

        let ext = self.extend(packet.sequence_number());
        let late = self.last_released.is_some_and(|released| ext <= released);
        if late || self.packets.contains_key(&ext) {
            self.stats.duplicates += 1;
            return PushOutcome::Duplicate;
        }

        if self.packets.len() >= self.config.max_packets
            || self.depth_ms >= self.config.max_depth_ms as u64
        {
            self.stats.overflows += 1;
            return PushOutcome::Overflow;
        }

        self.estimator
            .update(now, packet.timestamp(), self.clock_rate);
        if self.highest.is_none_or(|h| ext > h) {
            self.highest = Some(ext);
        }
        self.depth_ms += packet.payload_duration_ms as u64;
        self.packets.insert(
            ext,
            Slot {
                packet,
                arrival: now,
            },
        );
        PushOutcome::Accepted
    }

    pub fn pop(&mut self) -> PopOutcome {
        self.pop_at(Instant::now())
    }

    pub fn pop_at(&mut self, now: Instant) -> PopOutcome {
        self.pop_inner(now, false)
    }

    fn pop_inner(&mut self, now: Instant, force: bool) -> PopOutcome {
        let Some((&key, slot)) = self.packets.first_key_value() else {
            return PopOutcome::Empty;
        };
        let expected = self.last_released.map_or(key, |released| released + 1);

        if key == expected {
            if force || self.depth_ms >= self.target_depth_ms() as u64 {
                return self.release(key);
            }
            return PopOutcome::Buffering;
        }

        let waited = now.saturating_duration_since(slot.arrival);
        let timed_out = waited >= Duration::from_millis(self.config.loss_timeout_ms as u64);
        let too_deep = self.depth_ms >= self.config.max_depth_ms as u64;
        if force || timed_out || too_deep {
            let lost = (key - expected).min(u16::MAX as i64) as u16;
            self.last_released = Some(key - 1);
            self.stats.lost += lost as u64;
            return PopOutcome::Dropped { lost };
        }
        PopOutcome::Buffering
    }

    fn release(&mut self, key: i64) -> PopOutcome {
        match self.packets.remove(&key) {
            Some(slot) => {
                self.depth_ms = self
                    .depth_ms
                    .saturating_sub(slot.packet.payload_duration_ms as u64);
                self.last_released = Some(key);
                self.stats.released += 1;
                PopOutcome::Ready(slot.packet)
            }
            None => PopOutcome::Empty,
        }
    }

    /// Release everything still buffered, in order, reporting the holes
    pub fn flush(&mut self) -> Vec<PopOutcome> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(self.packets.len());
        loop {
            match self.pop_inner(now, true) {
                PopOutcome::Empty => break,
                outcome => out.push(outcome),
            }
        }
        out
    }

    /// Forget every packet and the sequence history
    pub fn reset(&mut self) {
        self.packets.clear();
        self.highest = None;
        self.last_released = None;
        self.depth_ms = 0;
        self.estimator = JitterEstimator::default();
    }

    /// Buffered media duration
    pub fn depth_ms(&self) -> u64 {
        self.depth_ms
    }

    pub fn jitter_ms(&self) -> f64 {
        self.estimator.jitter_ms(self.clock_rate)
    }

    /// Depth required before in-order packets are released
    pub fn target_depth_ms(&self) -> u32 {
        let nominal = self.config.nominal_depth_ms;
        if !self.config.adaptive {
            return nominal;
        }
        let adaptive = (2.0 * self.jitter_ms()).ceil() as u32;
        nominal.max(adaptive).min(self.config.max_depth_ms)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            buffered_packets: self.packets.len(),
            depth_ms: self.depth_ms,
            jitter_ms: self.jitter_ms(),
            target_depth_ms: self.target_depth_ms(),
            ..self.stats.clone()
        }
    }

    /// Count a datagram that failed to parse
    pub fn record_malformed(&mut self) {
        self.stats.received += 1;
        self.stats.malformed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::receiver::rtp::build_packet;
    use proptest::prelude::*;

    fn config(nominal: u32) -> JitterConfig {
        JitterConfig {
            nominal_depth_ms: nominal,
            adaptive: false,
            ..JitterConfig::default()
        }
    }

    fn packet(seq: u16, duration_ms: u32) -> Arc<RawRtpPacket> {
        let ts = (seq as u32).wrapping_mul(960);
        let raw = RawRtpPacket::parse(build_packet(111, seq, ts, false, &[seq as u8, 0xAB])).unwrap();
        Arc::new(raw.with_duration_ms(duration_ms))
    }

    fn ready_seq(outcome: PopOutcome) -> u16 {
        match outcome {
            PopOutcome::Ready(p) => p.sequence_number(),
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    fn drain(jb: &mut JitterBuffer, now: Instant) -> Vec<u16> {
        let mut out = Vec::new();
        while let PopOutcome::Ready(p) = jb.pop_at(now) {
            out.push(p.sequence_number());
        }
        out
    }

    #[test]
    fn test_empty() {
        let mut jb = JitterBuffer::new(config(80), 48_000);
        assert_eq!(jb.pop(), PopOutcome::Empty);
        assert!(jb.is_empty());
    }

    #[test]
    fn test_reorders_packets() {
        let mut jb = JitterBuffer::new(config(0), 48_000);
        let now = Instant::now();
        for seq in [3, 1, 2, 5, 4] {
            assert_eq!(jb.push_at(packet(seq, 20), now), PushOutcome::Accepted);
        }
        assert_eq!(drain(&mut jb, now), vec![1, 2, 3, 4, 5]);
        assert_eq!(jb.stats().released, 5);
    }

    #[test]
    fn test_buffering_until_target_depth() {
        let mut jb = JitterBuffer::new(config(60), 48_000);
        let now = Instant::now();
        jb.push_at(packet(10, 20), now);
        jb.push_at(packet(11, 20), now);
        assert_eq!(jb.pop_at(now), PopOutcome::Buffering);
        assert_eq!(jb.depth_ms(), 40);

        jb.push_at(packet(12, 20), now);
        assert_eq!(ready_seq(jb.pop_at(now)), 10);
        // depth fell back below target
        assert_eq!(jb.pop_at(now), PopOutcome::Buffering);
        assert_eq!(jb.depth_ms(), 40);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut jb = JitterBuffer::new(config(0), 48_000);
        let now = Instant::now();
        for seq in [65534, 65535, 0, 1] {
            assert_eq!(jb.push_at(packet(seq, 20), now), PushOutcome::Accepted);
        }
        assert_eq!(drain(&mut jb, now), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_wraparound_out_of_order() {
        let mut jb = JitterBuffer::new(config(0), 48_000);
        let now = Instant::now();
        for seq in [0, 65535, 1, 65534] {
            jb.push_at(packet(seq, 20), now);
        }
        assert_eq!(drain(&mut jb, now), vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn test_duplicate_and_late_packets_dropped() {
        let mut jb = JitterBuffer::new(config(0), 48_000);
        let now = Instant::now();
        jb.push_at(packet(100, 20), now);
        assert_eq!(jb.push_at(packet(100, 20), now), PushOutcome::Duplicate);
        assert_eq!(ready_seq(jb.pop_at(now)), 100);

        assert_eq!(jb.push_at(packet(100, 20), now), PushOutcome::Duplicate);
        assert_eq!(jb.push_at(packet(99, 20), now), PushOutcome::Duplicate);
        assert_eq!(jb.pop_at(now), PopOutcome::Empty);
        assert_eq!(jb.stats().duplicates, 3);
    }

    #[test]
    fn test_gap_waits_then_drops() {
        let mut jb = JitterBuffer::new(config(0), 48_000);
        let t0 = Instant::now();
        jb.push_at(packet(1, 20), t0);
        jb.push_at(packet(3, 20), t0);
        assert_eq!(ready_seq(jb.pop_at(t0)), 1);

        // seq 2 is missing: wait for it
        assert_eq!(jb.pop_at(t0 + Duration::from_millis(50)), PopOutcome::Buffering);

        let late = t0 + Duration::from_millis(160);
        assert_eq!(jb.pop_at(late), PopOutcome::Dropped { lost: 1 });
        assert_eq!(ready_seq(jb.pop_at(late)), 3);

        // the skipped packet is never delivered afterwards
        assert_eq!(jb.push_at(packet(2, 20), late), PushOutcome::Duplicate);
        assert_eq!(jb.stats().lost, 1);
    }

    #[test]
    fn test_gap_filled_in_time() {
        let mut jb = JitterBuffer::new(config(0), 48_000);
        let t0 = Instant::now();
        jb.push_at(packet(1, 20), t0);
        jb.push_at(packet(3, 20), t0);
        assert_eq!(ready_seq(jb.pop_at(t0)), 1);
        assert_eq!(jb.pop_at(t0), PopOutcome::Buffering);

        jb.push_at(packet(2, 20), t0 + Duration::from_millis(30));
        assert_eq!(drain(&mut jb, t0 + Duration::from_millis(30)), vec![2, 3]);
        assert_eq!(jb.stats().lost, 0);
    }

    #[test]
    fn test_max_depth_forces_skip() {
        let mut cfg = config(0);
        cfg.max_depth_ms = 100;
        cfg.loss_timeout_ms = 10_000;
        let mut jb = JitterBuffer::new(cfg, 48_000);
        let t0 = Instant::now();
        jb.push_at(packet(1, 20), t0);
        assert_eq!(ready_seq(jb.pop_at(t0)), 1);
        for seq in 5..10 {
            jb.push_at(packet(seq, 20), t0);
        }
        assert_eq!(jb.pop_at(t0), PopOutcome::Dropped { lost: 3 });
        assert_eq!(ready_seq(jb.pop_at(t0)), 5);
    }

    #[test]
    fn test_overflow() {
        let mut cfg = config(0);
        cfg.max_packets = 2;
        let mut jb = JitterBuffer::new(cfg, 48_000);
        let now = Instant::now();
        assert_eq!(jb.push_at(packet(1, 20), now), PushOutcome::Accepted);
        assert_eq!(jb.push_at(packet(2, 20), now), PushOutcome::Accepted);
        assert_eq!(jb.push_at(packet(3, 20), now), PushOutcome::Overflow);
        assert_eq!(jb.stats().overflows, 1);
    }

    #[test]
    fn test_malformed_empty_payload() {
        let mut jb = JitterBuffer::new(config(0), 48_000);
        let raw = RawRtpPacket::parse(build_packet(96, 1, 0, false, &[])).unwrap();
        assert_eq!(jb.push(Arc::new(raw)), PushOutcome::Malformed);
        assert_eq!(jb.stats().malformed, 1);
    }

    #[test]
    fn test_flush_reports_holes() {
        let mut jb = JitterBuffer::new(config(500), 48_000);
        let now = Instant::now();
        for seq in [1, 2, 4] {
            jb.push_at(packet(seq, 20), now);
        }
        let out = jb.flush();
        assert_eq!(out.len(), 4);
        assert_eq!(ready_seq(out[0].clone()), 1);
        assert_eq!(ready_seq(out[1].clone()), 2);
        assert_eq!(out[2], PopOutcome::Dropped { lost: 1 });
        assert_eq!(ready_seq(out[3].clone()), 4);
        assert!(jb.is_empty());
        assert_eq!(jb.depth_ms(), 0);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut jb = JitterBuffer::new(config(0), 48_000);
        let now = Instant::now();
        jb.push_at(packet(500, 20), now);
        assert_eq!(ready_seq(jb.pop_at(now)), 500);
        jb.reset();
        assert_eq!(jb.push_at(packet(10, 20), now), PushOutcome::Accepted);
        assert_eq!(ready_seq(jb.pop_at(now)), 10);
    }

    #[test]
    fn test_adaptive_target_tracks_jitter() {
        let cfg = JitterConfig {
            nominal_depth_ms: 10,
            adaptive: true,
            ..JitterConfig::default()
        };
        let mut jb = JitterBuffer::new(cfg, 48_000);
        let t0 = Instant::now();
        // 20 ms of media per packet, arrivals alternating 0 and 60 ms late
        for i in 0..64u16 {
            let late = if i % 2 == 0 { 0 } else { 60 };
            let at = t0 + Duration::from_millis(i as u64 * 20 + late);
            jb.push_at(packet(i, 20), at);
        }
        assert!(jb.jitter_ms() > 10.0);
        assert!(jb.target_depth_ms() > 10);
        assert!(jb.target_depth_ms() <= jb.config().max_depth_ms);
    }

    proptest! {
        #[test]
        fn prop_releases_in_ascending_order(
            (base, order) in (any::<u16>(), 1usize..120).prop_flat_map(|(base, n)| {
                (Just(base), Just((0..n as u16).collect::<Vec<_>>()).prop_shuffle())
            })
        ) {
            // room for the longest shuffle before any pop
            let cfg = JitterConfig {
                max_depth_ms: 5_000,
                ..config(0)
            };
            let mut jb = JitterBuffer::new(cfg, 48_000);
            let now = Instant::now();
            for &offset in &order {
                prop_assert_eq!(jb.push_at(packet(base.wrapping_add(offset), 20), now), PushOutcome::Accepted);
            }
            let released = drain(&mut jb, now);
            let expected: Vec<u16> = (0..order.len() as u16).map(|o| base.wrapping_add(o)).collect();
            prop_assert_eq!(released, expected);
        }
    }
}
