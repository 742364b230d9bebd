//! Receiver pipeline components
//!
//! The pull side of a track:
//! ```text
//! Network → Depacketizer::push_packet → JitterBuffer ─(PopTimer)→ H.264/Opus depacketize
//!         → BoundedQueue<MediaPacket> → DecodeStage → BoundedQueue<DecodedFrame>
//! ```

pub mod coordinator;
pub mod decode_stage;
pub mod depacketizer;
pub mod jitter;
pub mod pop_timer;
pub mod rtp;

pub use coordinator::ReceiverCoordinator;
pub use decode_stage::DecodeStage;
pub use depacketizer::{Depacketizer, DepacketizerStats, H264Assembler, PayloadDurationEstimator};
pub use jitter::{JitterBuffer, JitterStats, PopOutcome, PushOutcome};
pub use pop_timer::PopTimer;
pub use rtp::{RawRtpPacket, RtpHeader};
