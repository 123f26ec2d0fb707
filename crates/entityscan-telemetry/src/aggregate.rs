//! Exact counters and a bounded sample buffer for one run
//!
//! Counts are never sampled. Only the retained example records are capped,
//! so memory stays bounded regardless of input size or match rate.

use crate::report::{category_breakdown, percentage, RunMeta, RunReport, SampleRecord};
use chrono::Utc;
use entityscan_core::{ClassificationResult, Record, SourceStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Sample buffer limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateConfig {
    /// Total samples kept across all categories
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,

    /// Optional cap per category
    #[serde(default)]
    pub per_category_cap: Option<usize>,

    /// Characters kept per sample
    #[serde(default = "default_sample_text_chars")]
    pub sample_text_chars: usize,

    /// Samples repeated at the top of the report
    #[serde(default = "default_headline_samples")]
    pub headline_samples: usize,

    /// Characters kept per headline sample
    #[serde(default = "default_headline_text_chars")]
    pub headline_text_chars: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            sample_cap: default_sample_cap(),
            per_category_cap: None,
            sample_text_chars: default_sample_text_chars(),
            headline_samples: default_headline_samples(),
            headline_text_chars: default_headline_text_chars(),
        }
    }
}

fn default_sample_cap() -> usize {
    10_000
}

fn default_sample_text_chars() -> usize {
    300
}

fn default_headline_samples() -> usize {
    100
}

fn default_headline_text_chars() -> usize {
    150
}

/// Exact run counters
///
/// Serialized flat into reports and carried in checkpoints so a resumed
/// run continues the same totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub total_records: u64,
    pub total_matches: u64,
    pub total_excluded: u64,
    pub total_unmatched: u64,
    #[serde(default)]
    pub decode_errors: u64,
    #[serde(default)]
    pub decode_replaced: u64,
    #[serde(default)]
    pub failed_writes: u64,
    /// Category -> matches
    #[serde(default)]
    pub categories: BTreeMap<String, u64>,
    /// Risk tier -> matches
    #[serde(default)]
    pub risk_tiers: BTreeMap<String, u64>,
    /// Exclusion group -> excluded records
    #[serde(default)]
    pub exclusions: BTreeMap<String, u64>,
}

impl Counts {
    /// Add another run's counts into this one
    pub fn merge(&mut self, other: &Counts) {
        self.total_records += other.total_records;
        self.total_matches += other.total_matches;
        self.total_excluded += other.total_excluded;
        self.total_unmatched += other.total_unmatched;
        self.decode_errors += other.decode_errors;
        self.decode_replaced += other.decode_replaced;
        self.failed_writes += other.failed_writes;
        merge_map(&mut self.categories, &other.categories);
        merge_map(&mut self.risk_tiers, &other.risk_tiers);
        merge_map(&mut self.exclusions, &other.exclusions);
    }

    /// Whether matches, exclusions and unmatched records add up to the total
    pub fn is_partitioned(&self) -> bool {
        self.total_records == self.total_matches + self.total_excluded + self.total_unmatched
    }

    /// Matches as a percentage of records scanned
    pub fn match_percentage(&self) -> f64 {
        percentage(self.total_matches, self.total_records)
    }
}

fn merge_map(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (key, count) in from {
        *into.entry(key.clone()).or_insert(0) += count;
    }
}

/// Per-run accumulator
pub struct AggregateStats {
    config: AggregateConfig,
    counts: Counts,
    source_stats: SourceStats,
    session_records: u64,
    samples: Vec<SampleRecord>,
    per_category_samples: HashMap<String, usize>,
    first_line: Option<u64>,
    last_line: Option<u64>,
    started: Instant,
}

impl AggregateStats {
    /// Start an empty accumulator
    pub fn new(config: AggregateConfig) -> Self {
        Self::resume(config, Counts::default())
    }

    /// Start from counts restored out of a checkpoint
    pub fn resume(config: AggregateConfig, counts: Counts) -> Self {
        Self {
            config,
            counts,
            source_stats: SourceStats::default(),
            session_records: 0,
            samples: Vec::new(),
            per_category_samples: HashMap::new(),
            first_line: None,
            last_line: None,
            started: Instant::now(),
        }
    }

    /// Account for one classified record
    pub fn record_result(&mut self, record: &Record, result: &ClassificationResult) {
        self.counts.total_records += 1;
        self.session_records += 1;
        self.first_line.get_or_insert(record.line_number);
        self.last_line = Some(record.line_number);

        if result.excluded {
            self.counts.total_excluded += 1;
            if let Some(group) = &result.group {
                *self.counts.exclusions.entry(group.clone()).or_insert(0) += 1;
            }
            return;
        }

        let (Some(category), true) = (&result.category, result.matched) else {
            self.counts.total_unmatched += 1;
            return;
        };

        self.counts.total_matches += 1;
        *self.counts.categories.entry(category.clone()).or_insert(0) += 1;
        let tier = result.risk_tier.unwrap_or_default();
        *self
            .counts
            .risk_tiers
            .entry(tier.as_str().to_string())
            .or_insert(0) += 1;

        if self.samples.len() >= self.config.sample_cap {
            return;
        }
        let taken = self.per_category_samples.entry(category.clone()).or_insert(0);
        if self.config.per_category_cap.is_some_and(|cap| *taken >= cap) {
            return;
        }
        *taken += 1;

        self.samples.push(SampleRecord {
            line: record.line_number,
            category: category.clone(),
            entity: result.matched_pattern.clone().unwrap_or_default(),
            risk_tier: tier,
            text: truncate_chars(&record.raw_text, self.config.sample_text_chars).to_string(),
        });
    }

    /// Latest reader counters for this session
    pub fn set_source_stats(&mut self, stats: SourceStats) {
        self.source_stats = stats;
    }

    /// Rows the sink gave up on
    pub fn add_failed_writes(&mut self, rows: u64) {
        self.counts.failed_writes += rows;
    }

    /// Counters including this session's decode statistics
    pub fn counts(&self) -> Counts {
        let mut counts = self.counts.clone();
        counts.decode_errors += self.source_stats.decode_errors;
        counts.decode_replaced += self.source_stats.decode_replaced;
        counts
    }

    pub fn total_records(&self) -> u64 {
        self.counts.total_records
    }

    /// Records classified by this process (excludes restored counts)
    pub fn session_records(&self) -> u64 {
        self.session_records
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    pub fn first_line(&self) -> Option<u64> {
        self.first_line
    }

    pub fn last_line(&self) -> Option<u64> {
        self.last_line
    }

    /// Build the run report from what has been aggregated so far
    pub fn finalize(&self, meta: &RunMeta) -> RunReport {
        let counts = self.counts();
        let elapsed = self.started.elapsed().as_secs_f64();
        let records_per_second = if elapsed > 0.0 {
            self.session_records as f64 / elapsed
        } else {
            0.0
        };

        let headline_samples = self
            .samples
            .iter()
            .take(self.config.headline_samples)
            .map(|sample| SampleRecord {
                text: truncate_chars(&sample.text, self.config.headline_text_chars).to_string(),
                ..sample.clone()
            })
            .collect();

        RunReport {
            run_id: meta.run_id.clone(),
            source: meta.source.clone(),
            file: meta.file.clone(),
            status: meta.status,
            partial: meta.status.is_partial(),
            error: meta.error.clone(),
            percentage: counts.match_percentage(),
            category_breakdown: category_breakdown(&counts.categories, counts.total_matches),
            counts,
            processing_time_seconds: elapsed,
            records_per_second,
            resumed_from_line: meta.resumed_from_line,
            last_line: self.last_line.or(meta.resumed_from_line),
            config_fingerprint: meta.config_fingerprint.clone(),
            started_at: meta.started_at,
            finished_at: Utc::now(),
            merged_from: Vec::new(),
            headline_samples,
            sample_records: self.samples.clone(),
        }
    }
}

/// Longest prefix of `text` with at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
