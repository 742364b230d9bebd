//! Container / transport write sinks
//!
//! [`ContainerSink`] is what the publisher writes into: an RTMP mux, a WebRTC
//! send track, a file. Only the publish stage calls it.

pub mod file;
pub mod memory;
pub mod webrtc;

use crate::error::SinkError;
use crate::pipeline::types::{MediaKind, MediaPacket, Rational};

pub use file::AnnexBFileSink;
pub use memory::MemorySink;
pub use webrtc::WebRtcSampleSink;

pub trait ContainerSink: Send {
    /// Timebase of the destination track for `kind`, `None` when there is no such track
    fn timebase(&self, kind: MediaKind) -> Option<Rational>;

    /// Write one packet whose timestamps are already in the track timebase
    fn write(&mut self, packet: MediaPacket) -> Result<(), SinkError>;

    /// Finalize the container; called exactly once
    fn write_trailer(&mut self) -> Result<(), SinkError>;
}
