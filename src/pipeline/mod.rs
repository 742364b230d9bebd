//! Media data-plane
//!
//! Stages are plain structs implementing [`PipelineStage`]; each one runs on
//! its own [`StageWorker`] thread and pulls from a [`BoundedQueue`]. The
//! coordinators chain them and own the stop order:
//! - receiver: RTP → jitter buffer → depacketizer → decoder
//! - sender: reframer → encoder → publisher
//!
//! Every stop drains upstream before downstream, so nothing queued before a
//! `stop()` call is lost and no stage runs after its consumer has gone.

pub mod health;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod stage;
pub mod state;
pub mod types;

pub use health::{HealthSummary, PipelineHealth};
pub use queue::BoundedQueue;
pub use receiver::ReceiverCoordinator;
pub use sender::SenderCoordinator;
pub use stage::{PipelineStage, StageWorker};
pub use state::{PublisherState, StageState};
pub use types::{
    AudioBuffer, AudioFormat, CodecId, DecodedFrame, FrameData, MediaKind, MediaPacket, PixelFormat,
    Rational, SampleFormat, StreamDescriptor, VideoBuffer,
};
