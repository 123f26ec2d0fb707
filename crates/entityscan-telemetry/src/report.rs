//! Run report artifact

use crate::aggregate::Counts;
use chrono::{DateTime, Utc};
use entityscan_core::{Error, Result, RiskTier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Reached the end of input
    Complete,
    /// Stopped by a signal
    Interrupted,
    /// Stopped by a source or sink error
    Failed,
}

impl RunStatus {
    pub fn is_partial(&self) -> bool {
        !matches!(self, Self::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

/// Identity of a run, fixed before streaming starts
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub run_id: String,
    pub source: String,
    pub file: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub config_fingerprint: String,
    pub started_at: DateTime<Utc>,
    pub resumed_from_line: Option<u64>,
}

impl RunMeta {
    /// New run with a fresh id, started now
    pub fn new(
        source: impl Into<String>,
        file: impl Into<String>,
        config_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4()),
            source: source.into(),
            file: file.into(),
            status: RunStatus::Complete,
            error: None,
            config_fingerprint: config_fingerprint.into(),
            started_at: Utc::now(),
            resumed_from_line: None,
        }
    }
}

/// One retained example of a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub line: u64,
    /// Category
    #[serde(rename = "type")]
    pub category: String,
    /// Pattern that fired
    pub entity: String,
    pub risk_tier: RiskTier,
    pub text: String,
}

/// Category row of the breakdown, sorted by descending count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: u64,
    /// Share of all matches
    pub percentage: f64,
}

/// Final JSON artifact of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub source: String,
    pub file: String,
    pub status: RunStatus,
    pub partial: bool,
    pub error: Option<String>,
    #[serde(flatten)]
    pub counts: Counts,
    pub percentage: f64,
    pub category_breakdown: Vec<CategoryCount>,
    pub processing_time_seconds: f64,
    pub records_per_second: f64,
    pub resumed_from_line: Option<u64>,
    pub last_line: Option<u64>,
    pub config_fingerprint: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Files folded into this report by `merge`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
    pub headline_samples: Vec<SampleRecord>,
    pub sample_records: Vec<SampleRecord>,
}

impl RunReport {
    /// Sum several reports of the same pattern configuration
    ///
    /// Samples are concatenated in input order. The result is partial if
    /// any input was.
    pub fn merge(reports: &[RunReport]) -> Result<RunReport> {
        let first = reports
            .first()
            .ok_or_else(|| Error::config("nothing to merge"))?;

        if let Some(other) = reports
            .iter()
            .find(|r| r.config_fingerprint != first.config_fingerprint)
        {
            return Err(Error::config(format!(
                "cannot merge reports built from different pattern configs ({} vs {})",
                first.file, other.file
            )));
        }

        let mut counts = Counts::default();
        let mut processing_time_seconds = 0.0;
        let mut status = RunStatus::Complete;
        let mut errors = Vec::new();
        let mut merged_from = Vec::new();
        let mut headline_samples = Vec::new();
        let mut sample_records = Vec::new();
        let headline_cap = reports
            .iter()
            .map(|r| r.headline_samples.len())
            .max()
            .unwrap_or(0);

        for report in reports {
            counts.merge(&report.counts);
            processing_time_seconds += report.processing_time_seconds;
            status = match (status, report.status) {
                (RunStatus::Failed, _) | (_, RunStatus::Failed) => RunStatus::Failed,
                (RunStatus::Interrupted, _) | (_, RunStatus::Interrupted) => {
                    RunStatus::Interrupted
                }
                _ => RunStatus::Complete,
            };
            if let Some(error) = &report.error {
                errors.push(format!("{}: {}", report.file, error));
            }
            if report.merged_from.is_empty() {
                merged_from.push(report.file.clone());
            } else {
                merged_from.extend(report.merged_from.iter().cloned());
            }
            for sample in &report.headline_samples {
                if headline_samples.len() < headline_cap {
                    headline_samples.push(sample.clone());
                }
            }
            sample_records.extend(report.sample_records.iter().cloned());
        }

        let same_source = reports.iter().all(|r| r.source == first.source);
        let records_per_second = if processing_time_seconds > 0.0 {
            counts.total_records as f64 / processing_time_seconds
        } else {
            0.0
        };

        Ok(RunReport {
            run_id: format!("run_{}", uuid::Uuid::new_v4()),
            source: if same_source {
                first.source.clone()
            } else {
                "merged".to_string()
            },
            file: merged_from.join(","),
            status,
            partial: status.is_partial(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            percentage: counts.match_percentage(),
            category_breakdown: category_breakdown(&counts.categories, counts.total_matches),
            counts,
            processing_time_seconds,
            records_per_second,
            resumed_from_line: None,
            last_line: reports.iter().filter_map(|r| r.last_line).max(),
            config_fingerprint: first.config_fingerprint.clone(),
            started_at: reports
                .iter()
                .map(|r| r.started_at)
                .min()
                .unwrap_or(first.started_at),
            finished_at: reports
                .iter()
                .map(|r| r.finished_at)
                .max()
                .unwrap_or(first.finished_at),
            merged_from,
            headline_samples,
            sample_records,
        })
    }

    /// Short human-readable summary for the console
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let c = &self.counts;

        if self.partial {
            let _ = writeln!(
                out,
                "Scan {} (partial report): {}",
                self.status.as_str().to_uppercase(),
                self.file
            );
            if let Some(error) = &self.error {
                let _ = writeln!(out, "  Error:            {}", error);
            }
        } else {
            let _ = writeln!(out, "Scan complete: {}", self.file);
        }

        let _ = writeln!(out, "  Records scanned:  {}", c.total_records);
        let _ = writeln!(
            out,
            "  Matches:          {} ({:.2}%)",
            c.total_matches, self.percentage
        );
        let _ = writeln!(out, "  Excluded:         {}", c.total_excluded);
        let _ = writeln!(out, "  Unmatched:        {}", c.total_unmatched);
        if c.decode_errors > 0 || c.decode_replaced > 0 {
            let _ = writeln!(
                out,
                "  Decode errors:    {} skipped, {} replaced",
                c.decode_errors, c.decode_replaced
            );
        }
        if c.failed_writes > 0 {
            let _ = writeln!(
                out,
                "  Failed writes:    {} (store counts are a lower bound)",
                c.failed_writes
            );
        }
        let _ = writeln!(
            out,
            "  Elapsed:          {:.1}s ({:.0} records/sec)",
            self.processing_time_seconds, self.records_per_second
        );

        if !self.category_breakdown.is_empty() {
            let _ = writeln!(out, "  Categories:");
            for row in &self.category_breakdown {
                let _ = writeln!(
                    out,
                    "    {:<36} {:>10} ({:.1}%)",
                    row.category, row.count, row.percentage
                );
            }
        }

        out
    }
}

/// `part` as a percentage of `total`, 0 when `total` is 0
pub fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Categories by descending count, ties by name
pub fn category_breakdown(
    categories: &BTreeMap<String, u64>,
    total_matches: u64,
) -> Vec<CategoryCount> {
    let mut rows: Vec<CategoryCount> = categories
        .iter()
        .map(|(category, &count)| CategoryCount {
            category: category.clone(),
            count,
            percentage: percentage(count, total_matches),
        })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.category.cmp(&b.category)));
    rows
}
