//! In-memory sink recording everything written to it

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::ContainerSink;
use crate::config::PublisherConfig;
use crate::error::SinkError;
use crate::pipeline::types::{MediaKind, MediaPacket, Rational};

#[derive(Debug, Default)]
struct Recorded {
    packets: Vec<MediaPacket>,
    trailers: usize,
    fail_after: Option<usize>,
}

/// Cloneable handle; every clone sees the same recorded packets
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    tracks: HashMap<MediaKind, Rational>,
    recorded: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    /// A sink without tracks; add them with [`MemorySink::with_track`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Audio and video tracks with the configured container timebases
    pub fn from_config(config: &PublisherConfig) -> Self {
        Self::new()
            .with_track(MediaKind::Video, config.video_timebase)
            .with_track(MediaKind::Audio, config.audio_timebase)
    }

    pub fn with_track(mut self, kind: MediaKind, timebase: Rational) -> Self {
        self.tracks.insert(kind, timebase);
        self
    }

    /// Fail every write after the first `writes` succeeded, like a broken connection
    pub fn fail_after(self, writes: usize) -> Self {
        self.lock().fail_after = Some(writes);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn packets(&self) -> Vec<MediaPacket> {
        self.lock().packets.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn trailer_count(&self) -> usize {
        self.lock().trailers
    }
}

impl ContainerSink for MemorySink {
    fn timebase(&self, kind: MediaKind) -> Option<Rational> {
        self.tracks.get(&kind).copied()
    }

    fn write(&mut self, packet: MediaPacket) -> Result<(), SinkError> {
        let mut recorded = self.lock();
        if recorded.trailers > 0 {
            return Err(SinkError::Closed("write after trailer".into()));
        }
        if let Some(limit) = recorded.fail_after
            && recorded.packets.len() >= limit
        {
            return Err(SinkError::Closed("connection reset by peer".into()));
        }
        recorded.packets.push(packet);
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), SinkError> {
        self.lock().trailers += 1;
        Ok(())
    }
}
