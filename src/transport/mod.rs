//! Network-receive adapters
//!
//! Each adapter runs as an async task, reads raw RTP datagrams from its
//! source and hands them to [`Depacketizer::push_packet`]. They stop when
//! their `CancellationToken` fires or the source ends.
//!
//! [`Depacketizer::push_packet`]: crate::pipeline::receiver::Depacketizer::push_packet

pub mod udp;
pub mod webrtc;

use std::fmt;

use crate::pipeline::receiver::PushOutcome;

pub use udp::UdpRtpReader;
pub use webrtc::{TrackReader, descriptor_for_codec};

/// Largest datagram read from the network
pub const MAX_DATAGRAM: usize = 1500;

/// What a reader fed into its depacketizer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSummary {
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub overflows: u64,
    pub malformed: u64,
}

impl ReadSummary {
    pub fn record(&mut self, outcome: PushOutcome) {
        self.received += 1;
        match outcome {
            PushOutcome::Accepted => self.accepted += 1,
            PushOutcome::Duplicate => self.duplicates += 1,
            PushOutcome::Overflow => self.overflows += 1,
            PushOutcome::Malformed => self.malformed += 1,
        }
    }
}

impl fmt::Display for ReadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} received, {} accepted, {} duplicate, {} overflow, {} malformed",
            self.received, self.accepted, self.duplicates, self.overflows, self.malformed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_outcomes() {
        let mut summary = ReadSummary::default();
        summary.record(PushOutcome::Accepted);
        summary.record(PushOutcome::Accepted);
        summary.record(PushOutcome::Duplicate);
        summary.record(PushOutcome::Malformed);
        assert_eq!(summary.received, 4);
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.to_string(), "4 received, 2 accepted, 1 duplicate, 0 overflow, 1 malformed");
    }
}
