//! Trailing-window speed averaging over monotonic transfer counters.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Averages download/upload speeds over a sliding time window.
///
/// Fed from cumulative byte counters; speeds are the counter delta between
/// the oldest and newest sample inside the window.
pub struct SpeedTracker {
    window: Duration,
    samples: VecDeque<Sample>,
}

struct Sample {
    at: Instant,
    downloaded: u64,
    uploaded: u64,
}

impl SpeedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, downloaded: u64, uploaded: u64) {
        let now = Instant::now();
        self.samples.push_back(Sample {
            at: now,
            downloaded,
            uploaded,
        });

        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns (download, upload) speeds in bytes per second.
    ///
    /// Zero until two samples exist; a single data point has no rate.
    pub fn speeds(&self) -> (f64, f64) {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return (0.0, 0.0);
        };

        let elapsed = last.at.duration_since(first.at).as_secs_f64();
        if self.samples.len() < 2 || elapsed <= 0.0 {
            return (0.0, 0.0);
        }

        let down = last.downloaded.saturating_sub(first.downloaded) as f64 / elapsed;
        let up = last.uploaded.saturating_sub(first.uploaded) as f64 / elapsed;
        (down, up)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sample_has_no_rate() {
        let mut tracker = SpeedTracker::new(Duration::from_secs(5));
        tracker.record(1_000_000, 0);
        assert_eq!(tracker.speeds(), (0.0, 0.0));
    }

    #[test]
    fn test_rate_from_counter_deltas() {
        let mut tracker = SpeedTracker::new(Duration::from_secs(5));
        tracker.record(0, 0);
        std::thread::sleep(Duration::from_millis(50));
        tracker.record(100_000, 10_000);

        let (down, up) = tracker.speeds();
        assert!(down > 0.0);
        assert!(up > 0.0);
        assert!(down > up);
    }

    #[test]
    fn test_counter_reset_does_not_panic() {
        let mut tracker = SpeedTracker::new(Duration::from_secs(5));
        tracker.record(100_000, 0);
        std::thread::sleep(Duration::from_millis(20));
        tracker.record(50_000, 0);

        let (down, _) = tracker.speeds();
        assert_eq!(down, 0.0);
    }
}
