//! Sender pipeline components
//!
//! The push side of a track:
//! ```text
//! decoded audio → AudioReframer (convert + FIFO) → EncodeStage ─┐
//!                                                               ├→ PublisherDrain → ContainerSink
//! raw video ─────────────────────────────────────→ EncodeStage ─┘
//! ```

pub mod convert;
pub mod coordinator;
pub mod encode_stage;
pub mod publish_stage;
pub mod reframer;

pub use convert::{AudioConverter, ConvertError, ConverterState, LinearResampler};
pub use coordinator::SenderCoordinator;
pub use encode_stage::EncodeStage;
pub use publish_stage::{PublishStage, PublisherDrain};
pub use reframer::{AudioReframer, ReframeStage};
