//! Per-stage health counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Health metrics for one stage
///
/// All fields use atomic operations, so the stage's worker thread records
/// while any other thread reads.
pub struct PipelineHealth {
    /// Items that went through the stage without error
    pub items_processed: AtomicU64,

    /// Items dropped on a transient error
    pub items_dropped: AtomicU64,

    /// Accumulation-state resets (assembler, resampler)
    pub stream_resets: AtomicU64,

    /// Fatal errors; the stage stopped itself after each one
    pub fatal_errors: AtomicU64,

    /// Total payload bytes of processed items
    pub bytes_processed: AtomicU64,

    pub keyframes_processed: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last successfully processed item
    pub last_item_time: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            items_processed: AtomicU64::new(0),
            items_dropped: AtomicU64::new(0),
            stream_resets: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            keyframes_processed: AtomicU64::new(0),
            last_item_time: AtomicU64::new(now_micros()),
        }
    }

    pub fn record_item(&self, size: usize, is_keyframe: bool) {
        self.last_item_time.store(now_micros(), Ordering::Relaxed);
        self.items_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self) {
        self.items_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.stream_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }

    pub fn items_dropped(&self) -> u64 {
        self.items_dropped.load(Ordering::Relaxed)
    }

    pub fn stream_resets(&self) -> u64 {
        self.stream_resets.load(Ordering::Relaxed)
    }

    pub fn fatal_errors(&self) -> u64 {
        self.fatal_errors.load(Ordering::Relaxed)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn keyframes_processed(&self) -> u64 {
        self.keyframes_processed.load(Ordering::Relaxed)
    }

    /// Calculate the drop rate as a percentage of processed items
    pub fn drop_rate(&self) -> f64 {
        let drops = self.items_dropped();
        let processed = self.items_processed();
        if processed == 0 {
            return 0.0;
        }
        (drops as f64 / processed as f64) * 100.0
    }

    /// Check if the stage has stalled (nothing processed for the given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = self.last_item_time.load(Ordering::Relaxed);
        now_micros().saturating_sub(last) > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            items_processed: self.items_processed(),
            items_dropped: self.items_dropped(),
            stream_resets: self.stream_resets(),
            fatal_errors: self.fatal_errors(),
            bytes_processed: self.bytes_processed(),
            keyframes_processed: self.keyframes_processed(),
            drop_rate: self.drop_rate(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub items_processed: u64,
    pub items_dropped: u64,
    pub stream_resets: u64,
    pub fatal_errors: u64,
    pub bytes_processed: u64,
    pub keyframes_processed: u64,
    pub drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} items ({} drops, {:.2}%), {} resets, {} fatal, {} bytes, {} keyframes",
            self.items_processed,
            self.items_dropped,
            self.drop_rate,
            self.stream_resets,
            self.fatal_errors,
            self.bytes_processed,
            self.keyframes_processed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = PipelineHealth::new();

        health.record_item(1000, false);
        health.record_item(2000, true);
        health.record_item(1500, false);

        assert_eq!(health.items_processed(), 3);
        assert_eq!(health.bytes_processed(), 4500);
        assert_eq!(health.keyframes_processed(), 1);
        assert_eq!(health.items_dropped(), 0);

        health.record_drop();
        health.record_drop();
        health.record_reset();

        assert_eq!(health.items_dropped(), 2);
        assert_eq!(health.stream_resets(), 1);
        assert!(health.drop_rate() > 0.0);
        assert!(health.summary().to_string().contains("2 drops"));
    }

    #[test]
    fn test_stall_detection() {
        let health = PipelineHealth::new();
        assert!(!health.is_stalled(Duration::from_secs(1)));

        health.record_item(1000, false);
        std::thread::sleep(Duration::from_millis(150));

        assert!(health.is_stalled(Duration::from_millis(100)));
    }
}
