//! Error taxonomy for the transport data-plane
//!
//! Every error raised inside a stage is classified so the owning
//! [`StageWorker`](crate::pipeline::stage::StageWorker) knows whether to drop
//! the item and continue, or to stop the stage and surface the error.

use thiserror::Error;

use crate::pipeline::types::MediaKind;

/// How an error must be handled by the stage that observed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Drop the item, log it, keep running
    Transient,
    /// The dependent accumulation state was reset; the next valid input re-establishes steady state
    StreamReset,
    /// The stage must stop itself and report upward
    FatalStage,
}

/// Errors produced while parsing RTP datagrams
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtpError {
    #[error("datagram too short for an RTP header ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("CSRC list ({csrc_count} entries) exceeds datagram length {len}")]
    CsrcOverrun { csrc_count: u8, len: usize },
    #[error("header extension overruns datagram length {0}")]
    ExtensionOverrun(usize),
    #[error("padding length {padding} invalid for payload of {payload} bytes")]
    BadPadding { padding: usize, payload: usize },
}

/// Errors reported by a codec service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("codec '{0}' is not available")]
    Unavailable(String),
    #[error("failed to open codec: {0}")]
    Open(String),
    #[error("codec rejected input: {0}")]
    Send(String),
    #[error("codec failed to produce output: {0}")]
    Receive(String),
    #[error("codec input does not match the configured stream kind {0}")]
    WrongKind(MediaKind),
}

/// Errors reported by a container / transport sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no track configured for {0} packets")]
    NoTrack(MediaKind),
    #[error("transport closed: {0}")]
    Closed(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Top-level pipeline error
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("rtp: {0}")]
    Rtp(#[from] RtpError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("sink: {0}")]
    Sink(#[from] SinkError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// A packet or frame was rejected at a stage boundary
    #[error("{stage}: dropped {what}")]
    Dropped { stage: &'static str, what: String },
    /// Accumulation state was reset because the input stream became undecodable
    #[error("{stage}: stream reset ({reason})")]
    Reset { stage: &'static str, reason: String },
    #[error("{stage}: {reason}")]
    Stage { stage: &'static str, reason: String },
}

impl PipelineError {
    /// Classify the error according to the stage handling policy
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Rtp(_) | PipelineError::Dropped { .. } => ErrorClass::Transient,
            PipelineError::Codec(CodecError::Send(_))
            | PipelineError::Codec(CodecError::Receive(_))
            | PipelineError::Codec(CodecError::WrongKind(_)) => ErrorClass::Transient,
            PipelineError::Reset { .. } => ErrorClass::StreamReset,
            PipelineError::Sink(SinkError::NoTrack(_)) => ErrorClass::Transient,
            PipelineError::Codec(_)
            | PipelineError::Sink(_)
            | PipelineError::Config(_)
            | PipelineError::Io(_)
            | PipelineError::Json(_)
            | PipelineError::Stage { .. } => ErrorClass::FatalStage,
        }
    }

    pub fn dropped(stage: &'static str, what: impl Into<String>) -> Self {
        PipelineError::Dropped {
            stage,
            what: what.into(),
        }
    }

    pub fn reset(stage: &'static str, reason: impl Into<String>) -> Self {
        PipelineError::Reset {
            stage,
            reason: reason.into(),
        }
    }

    pub fn fatal(stage: &'static str, reason: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage,
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::FatalStage
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
