//! Pipeline configuration
//!
//! Every tunable threshold of the data-plane lives here. All sections are
//! `#[serde(default)]`, so a JSON file only has to name the values it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::pipeline::types::{MediaKind, Rational, SampleFormat};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of items held before `enqueue` blocks
    pub capacity: usize,
    /// How long `dequeue` waits before reporting a timeout
    pub dequeue_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1500,
            dequeue_timeout_ms: 2000,
        }
    }
}

impl QueueConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Buffered duration required before packets are released
    pub nominal_depth_ms: u32,
    /// Upper bound of buffered duration; beyond it pushes overflow and gaps are skipped
    pub max_depth_ms: u32,
    /// Upper bound of buffered packets
    pub max_packets: usize,
    /// How long a missing sequence number is waited for
    pub loss_timeout_ms: u32,
    /// Period of the pop timer
    pub tick_ms: u64,
    /// Raise the target depth with the measured inter-arrival jitter
    pub adaptive: bool,
    /// Clamp applied to the per-packet duration estimate
    pub max_payload_ms: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            nominal_depth_ms: 80,
            max_depth_ms: 1000,
            max_packets: 2048,
            loss_timeout_ms: 160,
            tick_ms: 10,
            adaptive: true,
            max_payload_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Working sample rate fed to the encoder
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// Encoder frame size in samples per channel
    pub frame_size: usize,
    /// Timebase of the pts carried by re-framed audio
    pub timebase: Rational,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            sample_format: SampleFormat::F32Planar,
            frame_size: 960,
            timebase: Rational::new(1, 48_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub video_timebase: Rational,
    pub audio_timebase: Rational,
    /// Drop packets whose dts goes backwards on their track
    pub enforce_monotonic_dts: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            video_timebase: Rational::new(1, 90_000),
            audio_timebase: Rational::new(1, 48_000),
            enforce_monotonic_dts: true,
        }
    }
}

impl PublisherConfig {
    pub fn timebase_for(&self, kind: MediaKind) -> Rational {
        match kind {
            MediaKind::Video => self.video_timebase,
            MediaKind::Audio => self.audio_timebase,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub jitter: JitterConfig,
    pub audio: AudioConfig,
    pub publisher: PublisherConfig,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(PipelineError::Config("queue.capacity must be > 0".into()));
        }
        if self.jitter.tick_ms == 0 {
            return Err(PipelineError::Config("jitter.tick_ms must be > 0".into()));
        }
        if self.jitter.max_packets == 0 {
            return Err(PipelineError::Config("jitter.max_packets must be > 0".into()));
        }
        // the first packet is credited the nominal depth; at max depth every later push overflows
        if self.jitter.nominal_depth_ms >= self.jitter.max_depth_ms {
            return Err(PipelineError::Config(format!(
                "jitter.nominal_depth_ms ({}) must be below jitter.max_depth_ms ({})",
                self.jitter.nominal_depth_ms, self.jitter.max_depth_ms
            )));
        }
        if self.audio.sample_rate == 0 || self.audio.channels == 0 || self.audio.frame_size == 0 {
            return Err(PipelineError::Config(
                "audio sample_rate, channels and frame_size must be > 0".into(),
            ));
        }
        for (name, tb) in [
            ("audio.timebase", self.audio.timebase),
            ("publisher.video_timebase", self.publisher.video_timebase),
            ("publisher.audio_timebase", self.publisher.audio_timebase),
        ] {
            if !tb.is_valid() {
                return Err(PipelineError::Config(format!("{name} must be positive, got {tb}")));
            }
        }
        Ok(())
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue.capacity, 1500);
        assert_eq!(config.queue.dequeue_timeout(), Duration::from_millis(2000));
        assert_eq!(config.jitter.nominal_depth_ms, 80);
        assert_eq!(config.jitter.tick_ms, 10);
        assert_eq!(config.audio.frame_size, 960);
        assert_eq!(config.publisher.video_timebase, Rational::new(1, 90_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{ "jitter": { "nominal_depth_ms": 120 }, "audio": { "frame_size": 1024, "sample_format": "s16" } }"#,
        )
        .unwrap();
        assert_eq!(config.jitter.nominal_depth_ms, 120);
        assert_eq!(config.jitter.max_depth_ms, 1000);
        assert_eq!(config.audio.frame_size, 1024);
        assert_eq!(config.audio.sample_format, SampleFormat::S16);
        assert_eq!(config.queue.capacity, 1500);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(PipelineConfig::from_json_str(r#"{ "queue": { "capacity": 0 } }"#).is_err());
        assert!(
            PipelineConfig::from_json_str(
                r#"{ "jitter": { "nominal_depth_ms": 500, "max_depth_ms": 100 } }"#
            )
            .is_err()
        );
        assert!(
            PipelineConfig::from_json_str(
                r#"{ "jitter": { "nominal_depth_ms": 1000, "max_depth_ms": 1000 } }"#
            )
            .is_err()
        );
        assert!(
            PipelineConfig::from_json_str(
                r#"{ "jitter": { "nominal_depth_ms": 999, "max_depth_ms": 1000 } }"#
            )
            .is_ok()
        );
        assert!(
            PipelineConfig::from_json_str(
                r#"{ "publisher": { "video_timebase": { "num": 0, "den": 1 } } }"#
            )
            .is_err()
        );
        assert!(PipelineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "queue": {{ "capacity": 16, "dequeue_timeout_ms": 50 }} }}"#).unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.queue.capacity, 16);
        assert_eq!(config.queue.dequeue_timeout(), Duration::from_millis(50));

        assert!(PipelineConfig::from_file("/nonexistent/relaycast.json").is_err());
    }
}
