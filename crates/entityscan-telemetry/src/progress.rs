//! Periodic progress logging with throughput and ETA

use std::time::{Duration, Instant};
use tracing::info;

/// Point-in-time progress figures
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Records classified by this process
    pub records: u64,
    /// Current physical line in the input
    pub line: u64,
    pub elapsed: Duration,
    pub records_per_second: f64,
    /// Share of the expected total reached, when known
    pub percentage: Option<f64>,
    pub eta: Option<Duration>,
}

/// Decides when to log progress: every `every_records` or every
/// `interval`, whichever comes first
pub struct ProgressTracker {
    every_records: u64,
    interval: Duration,
    expected_total: Option<u64>,
    started: Instant,
    last_report: Instant,
    next_mark: u64,
}

impl ProgressTracker {
    pub fn new(every_records: u64, interval: Duration, expected_total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            every_records: every_records.max(1),
            interval,
            expected_total,
            started: now,
            last_report: now,
            next_mark: every_records.max(1),
        }
    }

    /// Log and return a snapshot if a threshold has been crossed
    pub fn tick(&mut self, records: u64, line: u64) -> Option<ProgressSnapshot> {
        let now = Instant::now();
        if records < self.next_mark && now.duration_since(self.last_report) < self.interval {
            return None;
        }

        while self.next_mark <= records {
            self.next_mark += self.every_records;
        }
        self.last_report = now;

        let snapshot = self.snapshot(records, line);
        match (snapshot.percentage, snapshot.eta) {
            (Some(pct), Some(eta)) => info!(
                "Processed {} records (line {}, {:.1}%) at {:.0} records/sec, ETA {}",
                records,
                line,
                pct,
                snapshot.records_per_second,
                format_duration(eta)
            ),
            _ => info!(
                "Processed {} records (line {}) at {:.0} records/sec",
                records, line, snapshot.records_per_second
            ),
        }
        Some(snapshot)
    }

    /// Current figures without logging
    pub fn snapshot(&self, records: u64, line: u64) -> ProgressSnapshot {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let records_per_second = if secs > 0.0 { records as f64 / secs } else { 0.0 };

        let percentage = self
            .expected_total
            .filter(|&total| total > 0)
            .map(|total| (line as f64 * 100.0 / total as f64).min(100.0));

        let eta = match self.expected_total {
            Some(total) if records_per_second > 0.0 => {
                let remaining = total.saturating_sub(line);
                Some(Duration::from_secs_f64(remaining as f64 / records_per_second))
            }
            _ => None,
        };

        ProgressSnapshot {
            records,
            line,
            elapsed,
            records_per_second,
            percentage,
            eta,
        }
    }
}

/// `1h 02m 03s`, `4m 05s`, `6s`
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_on_record_threshold() {
        let mut tracker = ProgressTracker::new(1000, Duration::from_secs(3600), None);
        assert!(tracker.tick(999, 999).is_none());
        assert!(tracker.tick(1000, 1000).is_some());
        assert!(tracker.tick(1500, 1500).is_none());
        assert!(tracker.tick(2048, 2048).is_some());
        assert!(tracker.tick(2999, 2999).is_none());
    }

    #[test]
    fn test_tick_on_interval() {
        let mut tracker = ProgressTracker::new(u64::MAX, Duration::ZERO, None);
        assert!(tracker.tick(1, 1).is_some());
    }

    #[test]
    fn test_snapshot_percentage() {
        let tracker = ProgressTracker::new(10, Duration::from_secs(30), Some(200));
        let snapshot = tracker.snapshot(50, 50);
        assert_eq!(snapshot.percentage, Some(25.0));

        let over = tracker.snapshot(300, 300);
        assert_eq!(over.percentage, Some(100.0));

        let unknown = ProgressTracker::new(10, Duration::from_secs(30), None);
        assert!(unknown.snapshot(5, 5).percentage.is_none());
        assert!(unknown.snapshot(5, 5).eta.is_none());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(6)), "6s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m 05s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }
}
