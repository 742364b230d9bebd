//! Network bytes → jitter buffer → depacketizer → packet queue → decoder

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use relaycast::codec::LoopbackCodec;
use relaycast::config::{JitterConfig, PipelineConfig};
use relaycast::pipeline::BoundedQueue;
use relaycast::pipeline::receiver::depacketizer::{NAL_IDR, contains_nal_type};
use relaycast::pipeline::receiver::rtp::build_packet;
use relaycast::pipeline::receiver::{Depacketizer, PushOutcome, ReceiverCoordinator};
use relaycast::pipeline::types::{MediaKind, MediaPacket, StreamDescriptor};
use relaycast::telemetry::{MemoryTelemetry, NullTelemetry};

const PT_H264: u8 = 96;
const PT_OPUS: u8 = 111;

fn immediate() -> JitterConfig {
    JitterConfig {
        nominal_depth_ms: 0,
        adaptive: false,
        ..JitterConfig::default()
    }
}

fn drain(queue: &BoundedQueue<MediaPacket>) -> Vec<MediaPacket> {
    std::iter::from_fn(|| queue.try_dequeue()).collect()
}

fn stap_a(nals: &[&[u8]]) -> Vec<u8> {
    let mut payload = vec![0x78];
    for nal in nals {
        payload.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        payload.extend_from_slice(nal);
    }
    payload
}

fn fu_a(nal: &[u8], max_body: usize) -> Vec<Vec<u8>> {
    let header = nal[0];
    let chunks: Vec<&[u8]> = nal[1..].chunks(max_body).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut fu = header & 0x1F;
            if i == 0 {
                fu |= 0x80;
            }
            if i == last {
                fu |= 0x40;
            }
            let mut out = vec![(header & 0xE0) | 28, fu];
            out.extend_from_slice(chunk);
            out
        })
        .collect()
}

#[test]
fn h264_access_units_survive_reordering() {
    let out = Arc::new(BoundedQueue::new(64, Duration::from_millis(10)));
    let depacketizer = Depacketizer::new(StreamDescriptor::h264(), &immediate(), out.clone(), Arc::new(NullTelemetry));

    let sps = [0x67, 0x42, 0xC0, 0x1F];
    let pps = [0x68, 0xCE, 0x3C, 0x80];
    let idr: Vec<u8> = std::iter::once(0x65).chain((0..=255u8).cycle().take(2500)).collect();
    let slice = [0x41, 0x9A, 0x00];

    let mut datagrams: Vec<Bytes> = vec![build_packet(PT_H264, 100, 0, false, &stap_a(&[&sps, &pps]))];
    for (i, frag) in fu_a(&idr, 1000).iter().enumerate() {
        datagrams.push(build_packet(PT_H264, 101 + i as u16, 0, i == 2, frag));
    }
    datagrams.push(build_packet(PT_H264, 104, 3000, true, &slice));

    let now = Instant::now();
    for index in [2, 0, 4, 1, 3] {
        assert_eq!(depacketizer.push_packet_at(datagrams[index].clone(), now), PushOutcome::Accepted);
    }
    // the same datagram again is a duplicate
    assert_eq!(depacketizer.push_packet_at(datagrams[1].clone(), now), PushOutcome::Duplicate);

    assert_eq!(depacketizer.process_pop_at(now), 4);
    let packets = drain(&out);
    let pts: Vec<_> = packets.iter().map(|p| p.pts).collect();
    assert_eq!(pts, vec![Some(0), Some(0), Some(0), Some(3000)]);
    assert!(packets.iter().all(|p| p.kind == MediaKind::Video));

    assert!(contains_nal_type(&packets[2].data, NAL_IDR));
    assert!(packets[2].is_keyframe);
    assert!(!packets[3].is_keyframe);
    assert_eq!(&packets[2].data[..4], &[0, 0, 0, 1]);
    assert_eq!(&packets[2].data[4..], &idr[..]);

    let stats = depacketizer.stats();
    assert_eq!(stats.jitter.duplicates, 1);
    assert_eq!(stats.jitter.lost, 0);
    assert_eq!(stats.packets_emitted, 4);
}

#[test]
fn lost_packet_is_skipped_after_timeout() {
    let out = Arc::new(BoundedQueue::new(64, Duration::from_millis(10)));
    let telemetry = Arc::new(MemoryTelemetry::new());
    let config = immediate();
    let depacketizer =
        Depacketizer::new(StreamDescriptor::opus(48_000, 1), &config, out.clone(), telemetry.clone());

    let start = Instant::now();
    for seq in [0u16, 1, 3, 4] {
        let datagram = build_packet(PT_OPUS, seq, 960 * seq as u32, false, &[seq as u8, 0]);
        depacketizer.push_packet_at(datagram, start);
    }

    assert_eq!(depacketizer.process_pop_at(start), 2);
    assert_eq!(depacketizer.process_pop_at(start + Duration::from_millis(10)), 0);

    let later = start + Duration::from_millis(config.loss_timeout_ms as u64 + 1);
    assert_eq!(depacketizer.process_pop_at(later), 2);

    let pts: Vec<_> = drain(&out).iter().map(|p| p.pts).collect();
    assert_eq!(pts, vec![Some(0), Some(960), Some(2880), Some(3840)]);
    assert_eq!(depacketizer.stats().jitter.lost, 1);
    assert!(telemetry.contains("lost"));
}

#[test]
fn malformed_datagrams_are_rejected() {
    let out = Arc::new(BoundedQueue::new(4, Duration::from_millis(10)));
    let depacketizer = Depacketizer::new(StreamDescriptor::h264(), &immediate(), out.clone(), Arc::new(NullTelemetry));

    assert_eq!(depacketizer.push_packet(Bytes::from_static(&[0x80, 0x60])), PushOutcome::Malformed);
    // version 1
    let mut bad = build_packet(PT_H264, 1, 0, false, &[0x41]).to_vec();
    bad[0] = 0x40;
    assert_eq!(depacketizer.push_packet(bad), PushOutcome::Malformed);

    assert_eq!(depacketizer.stats().jitter.malformed, 2);
    assert!(out.is_empty());
}

#[test]
fn receiver_gates_video_until_keyframe() {
    let mut config = PipelineConfig::default();
    config.jitter = immediate();
    config.jitter.tick_ms = 2;

    let mut receiver = ReceiverCoordinator::new(
        StreamDescriptor::h264().with_dimensions(2, 2),
        &config,
        Arc::new(LoopbackCodec::new()),
        Arc::new(NullTelemetry),
    );
    receiver.start().unwrap();

    receiver.push_packet(build_packet(PT_H264, 0, 0, true, &[0x41, 1]));
    receiver.push_packet(build_packet(PT_H264, 1, 3000, true, &[0x65, 2]));
    receiver.push_packet(build_packet(PT_H264, 2, 6000, true, &[0x41, 3]));

    let mut frames = Vec::new();
    while frames.len() < 2 {
        match receiver.frames().dequeue_timeout(Duration::from_secs(2)) {
            Some(frame) => frames.push(frame),
            None => break,
        }
    }
    receiver.stop();

    let pts: Vec<_> = frames.iter().map(|f| f.pts).collect();
    assert_eq!(pts, vec![Some(3000), Some(6000)]);
    assert!(receiver.frames().is_empty());
    assert!(receiver.take_error().is_none());
}
