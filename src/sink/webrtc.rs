//! WebRTC send-track sink
//!
//! Packets become `webrtc::media::Sample`s written to a
//! `TrackLocalStaticSample`; the track does its own RTP packetization.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::ContainerSink;
use crate::error::SinkError;
use crate::pipeline::types::{MediaKind, MediaPacket, Rational};

/// Sample duration when neither the packet nor the pts history tells
const FALLBACK_DURATION: Duration = Duration::from_millis(20);

/// Must be driven from a thread outside the tokio runtime, as the publish
/// worker thread is.
pub struct WebRtcSampleSink {
    track: Arc<TrackLocalStaticSample>,
    kind: MediaKind,
    timebase: Rational,
    runtime: Handle,
    last_pts: Option<i64>,
}

impl WebRtcSampleSink {
    pub fn new(track: Arc<TrackLocalStaticSample>, kind: MediaKind, timebase: Rational, runtime: Handle) -> Self {
        Self {
            track,
            kind,
            timebase,
            runtime,
            last_pts: None,
        }
    }

    fn ticks_to_duration(&self, ticks: i64) -> Duration {
        Duration::from_secs_f64(ticks.max(0) as f64 * self.timebase.as_f64())
    }

    /// The packet's own duration, else the distance to the previous pts
    fn duration_of(&mut self, packet: &MediaPacket) -> Duration {
        let from_history = match (packet.pts, self.last_pts) {
            (Some(pts), Some(last)) if pts > last => Some(pts - last),
            _ => None,
        };
        if let Some(pts) = packet.pts {
            self.last_pts = Some(pts);
        }
        if packet.duration > 0 {
            return self.ticks_to_duration(packet.duration);
        }
        from_history.map_or(FALLBACK_DURATION, |ticks| self.ticks_to_duration(ticks))
    }
}

impl ContainerSink for WebRtcSampleSink {
    fn timebase(&self, kind: MediaKind) -> Option<Rational> {
        (kind == self.kind).then_some(self.timebase)
    }

    fn write(&mut self, packet: MediaPacket) -> Result<(), SinkError> {
        let duration = self.duration_of(&packet);
        let sample = Sample {
            data: packet.data,
            duration,
            ..Default::default()
        };
        self.runtime
            .block_on(self.track.write_sample(&sample))
            .map_err(|e| SinkError::Write(e.to_string()))
    }

    fn write_trailer(&mut self) -> Result<(), SinkError> {
        // RTP has no trailer; the peer connection owns the track lifetime
        Ok(())
    }
}
