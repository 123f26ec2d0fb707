//! Run metrics published through the `metrics` facade
//!
//! Counters are published as deltas of [`Counts`] at checkpoint-sized
//! intervals rather than per record.

use crate::aggregate::Counts;
use std::time::Duration;

pub const RECORDS_TOTAL: &str = "entityscan_records_total";
pub const MATCHES_TOTAL: &str = "entityscan_matches_total";
pub const EXCLUDED_TOTAL: &str = "entityscan_excluded_total";
pub const DECODE_ERRORS_TOTAL: &str = "entityscan_decode_errors_total";
pub const FAILED_WRITES_TOTAL: &str = "entityscan_failed_writes_total";
pub const SCAN_SECONDS: &str = "entityscan_scan_seconds";

/// Register descriptions with the installed recorder
pub fn describe_metrics() {
    ::metrics::describe_counter!(RECORDS_TOTAL, "Total number of records classified");
    ::metrics::describe_counter!(MATCHES_TOTAL, "Matched records by category");
    ::metrics::describe_counter!(EXCLUDED_TOTAL, "Records dropped by an exclusion group");
    ::metrics::describe_counter!(DECODE_ERRORS_TOTAL, "Lines skipped as undecodable");
    ::metrics::describe_counter!(
        FAILED_WRITES_TOTAL,
        "Matched rows the store could not persist"
    );
    ::metrics::describe_histogram!(
        SCAN_SECONDS,
        ::metrics::Unit::Seconds,
        "Wall-clock duration of a scan run"
    );
}

/// Publishes counter deltas since the previous call
#[derive(Debug, Default)]
pub struct MetricsCollector {
    published: Counts,
}

impl MetricsCollector {
    /// Start from counts already published elsewhere (a resumed run)
    pub fn starting_at(counts: Counts) -> Self {
        Self { published: counts }
    }

    /// Emit the difference between `current` and what was last published
    pub fn publish(&mut self, current: &Counts) {
        let last = &self.published;

        increment(RECORDS_TOTAL, current.total_records, last.total_records);
        increment(EXCLUDED_TOTAL, current.total_excluded, last.total_excluded);
        increment(DECODE_ERRORS_TOTAL, current.decode_errors, last.decode_errors);
        increment(FAILED_WRITES_TOTAL, current.failed_writes, last.failed_writes);

        for (category, &count) in &current.categories {
            let before = last.categories.get(category).copied().unwrap_or(0);
            if count > before {
                ::metrics::counter!(MATCHES_TOTAL, "category" => category.clone())
                    .increment(count - before);
            }
        }

        self.published = current.clone();
    }

    /// Record the run duration
    pub fn record_duration(&self, elapsed: Duration) {
        ::metrics::histogram!(SCAN_SECONDS).record(elapsed.as_secs_f64());
    }

    /// Counts as of the last publish
    pub fn published(&self) -> &Counts {
        &self.published
    }
}

fn increment(name: &'static str, current: u64, last: u64) {
    if current > last {
        ::metrics::counter!(name).increment(current - last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_tracks_last_counts() {
        let mut collector = MetricsCollector::default();
        let mut counts = Counts {
            total_records: 10,
            total_matches: 2,
            total_unmatched: 8,
            ..Counts::default()
        };
        counts.categories.insert("company".to_string(), 2);

        collector.publish(&counts);
        assert_eq!(collector.published(), &counts);

        counts.total_records = 20;
        collector.publish(&counts);
        assert_eq!(collector.published().total_records, 20);
    }

    #[test]
    fn test_resumed_collector_skips_restored_counts() {
        let restored = Counts {
            total_records: 100,
            ..Counts::default()
        };
        let collector = MetricsCollector::starting_at(restored.clone());
        assert_eq!(collector.published(), &restored);
    }
}
