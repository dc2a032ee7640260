//! Byte and extent progress of a disk dump, with speed and ETA.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Point-in-time progress of one disk.
#[derive(Debug, Clone, Serialize)]
pub struct DumpProgress {
    /// Bytes the dump is expected to move
    pub total_bytes: u64,

    /// Bytes of extents already finished, successful or not
    pub processed_bytes: u64,

    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub percent_complete: f64,

    pub extents_done: u64,
    pub extents_failed: u64,
    pub total_extents: u64,
}

impl DumpProgress {
    pub fn new(total_bytes: u64, total_extents: u64) -> Self {
        Self {
            total_bytes,
            processed_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete: 0.0,
            extents_done: 0,
            extents_failed: 0,
            total_extents,
        }
    }

    fn set_processed(&mut self, processed_bytes: u64) {
        self.processed_bytes = processed_bytes;
        self.percent_complete = if self.total_bytes > 0 {
            ((processed_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else if self.total_extents == 0 {
            100.0
        } else {
            0.0
        };
    }

    pub fn is_complete(&self) -> bool {
        self.extents_done + self.extents_failed >= self.total_extents
    }
}

/// Accumulates finished extents and derives speed from the time between
/// samples.
pub struct ProgressTracker {
    start_time: Instant,
    last_sample_time: Instant,
    last_sample_bytes: u64,
    progress: DumpProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_extents: u64) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_sample_time: now,
            last_sample_bytes: 0,
            progress: DumpProgress::new(total_bytes, total_extents),
        }
    }

    pub fn extent_succeeded(&mut self, length: u64) {
        self.progress.extents_done += 1;
        let processed = self.progress.processed_bytes + length;
        self.progress.set_processed(processed);
    }

    pub fn extent_failed(&mut self, length: u64) {
        self.progress.extents_failed += 1;
        let processed = self.progress.processed_bytes + length;
        self.progress.set_processed(processed);
    }

    /// Recompute speed and ETA since the previous sample.
    pub fn sample(&mut self) -> &DumpProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_time).as_secs_f64();
        let processed = self.progress.processed_bytes;

        if elapsed > 0.0 {
            let diff = processed.saturating_sub(self.last_sample_bytes);
            self.progress.bytes_per_second = (diff as f64 / elapsed) as u64;
        }
        if self.progress.bytes_per_second > 0 {
            let remaining = self.progress.total_bytes.saturating_sub(processed);
            self.progress.eta_seconds = remaining / self.progress.bytes_per_second;
        }

        self.last_sample_time = now;
        self.last_sample_bytes = processed;
        &self.progress
    }

    /// Time since the previous sample.
    pub fn since_sample(&self) -> Duration {
        self.last_sample_time.elapsed()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.processed_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &DumpProgress {
        &self.progress
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counts_successes_and_failures() {
        let mut tracker = ProgressTracker::new(100, 4);
        tracker.extent_succeeded(25);
        tracker.extent_failed(25);

        let progress = tracker.progress();
        assert_eq!(progress.extents_done, 1);
        assert_eq!(progress.extents_failed, 1);
        assert_eq!(progress.processed_bytes, 50);
        assert!((progress.percent_complete - 50.0).abs() < 0.01);
        assert!(!progress.is_complete());

        tracker.extent_succeeded(25);
        tracker.extent_succeeded(25);
        assert!(tracker.progress().is_complete());
        assert!((tracker.progress().percent_complete - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_nothing_to_dump_is_complete() {
        let tracker = ProgressTracker::new(0, 0);
        assert!(tracker.progress().is_complete());
    }

    #[test]
    fn test_sample_computes_speed_and_eta() {
        let mut tracker = ProgressTracker::new(10_000, 10);
        thread::sleep(Duration::from_millis(50));
        tracker.extent_succeeded(1000);

        let progress = tracker.sample();
        assert!(progress.bytes_per_second > 0);
        assert!(progress.eta_seconds < 10_000);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed_and_duration() {
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
