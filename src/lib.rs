//! Real-time audio/video transport data-plane
//!
//! The pull side turns an unordered, lossy RTP stream back into decodable
//! packets and frames ([`pipeline::ReceiverCoordinator`]); the push side
//! re-frames, encodes and publishes them ([`pipeline::SenderCoordinator`]).
//! Codecs and containers sit behind the [`codec::CodecService`] and
//! [`sink::ContainerSink`] seams.

pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod telemetry;
pub mod transport;
pub mod utils;
pub mod xmacro;

pub use config::PipelineConfig;
pub use error::{ErrorClass, PipelineError, Result};
pub use telemetry::{LogTelemetry, MemoryTelemetry, NullTelemetry, SharedTelemetry, Telemetry, init_logging};
