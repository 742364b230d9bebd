//! WebRTC remote-track reader

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use super::ReadSummary;
use crate::pipeline::receiver::Depacketizer;
use crate::pipeline::types::StreamDescriptor;
use crate::telemetry::SharedTelemetry;
use crate::{emit_debug, emit_info, emit_warn};

/// Map a negotiated codec onto the stream it produces
pub fn descriptor_for_codec(mime_type: &str, clock_rate: u32, channels: u16) -> Option<StreamDescriptor> {
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        let mut descriptor = StreamDescriptor::h264();
        if clock_rate > 0 {
            descriptor.clock_rate = clock_rate;
        }
        Some(descriptor)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
        // Opus always runs a 48 kHz RTP clock
        Some(StreamDescriptor::opus(48_000, channels.max(1)))
    } else {
        None
    }
}

/// The descriptor of a remote track, if its codec is one the pipeline handles
pub fn descriptor_for_track(track: &TrackRemote) -> Option<StreamDescriptor> {
    let codec = track.codec();
    descriptor_for_codec(
        &codec.capability.mime_type,
        codec.capability.clock_rate,
        codec.capability.channels,
    )
}

/// Feeds the RTP packets of one remote track into a depacketizer
pub struct TrackReader {
    depacketizer: Arc<Depacketizer>,
    cancel: CancellationToken,
    telemetry: SharedTelemetry,
}

impl TrackReader {
    pub fn new(depacketizer: Arc<Depacketizer>, cancel: CancellationToken, telemetry: SharedTelemetry) -> Self {
        Self {
            depacketizer,
            cancel,
            telemetry,
        }
    }

    /// Read until cancelled or until the track ends
    pub async fn run(self, track: Arc<TrackRemote>) -> ReadSummary {
        let mut summary = ReadSummary::default();
        emit_info!(self.telemetry, "transport", "reading track ssrc={}", track.ssrc());

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = track.read_rtp() => read,
            };

            let packet = match read {
                Ok((packet, _)) => packet,
                Err(err) => {
                    emit_debug!(self.telemetry, "transport", "track ended: {}", err);
                    break;
                }
            };
            match packet.marshal() {
                Ok(datagram) => summary.record(self.depacketizer.push_packet(datagram)),
                Err(err) => emit_warn!(self.telemetry, "transport", "cannot serialize RTP packet: {}", err),
            }
        }

        emit_info!(self.telemetry, "transport", "track reader stopped: {}", summary);
        summary
    }

    pub fn spawn(self, track: Arc<TrackRemote>) -> JoinHandle<ReadSummary> {
        tokio::spawn(self.run(track))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::CodecId;

    #[test]
    fn test_descriptor_for_codec() {
        let video = descriptor_for_codec("video/h264", 90_000, 0).unwrap();
        assert_eq!(video.codec, CodecId::H264);
        assert_eq!(video.clock_rate, 90_000);

        let audio = descriptor_for_codec(MIME_TYPE_OPUS, 48_000, 2).unwrap();
        assert_eq!(audio, StreamDescriptor::opus(48_000, 2));

        assert!(descriptor_for_codec("video/VP8", 90_000, 0).is_none());
    }
}
