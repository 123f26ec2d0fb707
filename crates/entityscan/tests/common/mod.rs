//! Fixtures and mock collaborators shared by the integration tests

#![allow(dead_code)]

use entityscan::{PipelineConfig, ScanOutcome, ScanRequest, Scanner, StopSignal};
use entityscan_classifiers::{Classifier, PatternClassifier, PatternConfig};
use entityscan_core::{ClassificationResult, Error, Record, Result};
use entityscan_telemetry::{MatchRow, MatchStore};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Patterns from the three-line example: one exclusion, one company group
pub const COMPANY_YAML: &str = r#"
groups:
  - name: china_lake
    exclusion: true
    patterns:
      - regex: 'china\s+lake'
  - name: company
    category: company
    priority: 1
    risk_tier: high
    patterns: [huawei]
"#;

pub fn config(yaml: &str) -> PipelineConfig {
    PipelineConfig::from_yaml(yaml).unwrap()
}

pub fn classifier(config: &PipelineConfig) -> PatternClassifier {
    PatternClassifier::from_config(&config.patterns).unwrap()
}

pub fn builtin() -> (PipelineConfig, PatternClassifier) {
    let config = PipelineConfig::with_patterns(PatternConfig::builtin().unwrap());
    let classifier = classifier(&config);
    (config, classifier)
}

pub fn write_lines(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let content: String = lines.iter().map(|l| format!("{}\n", l)).collect();
    std::fs::write(&path, content).unwrap();
    path
}

pub fn write_gzip(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    for line in lines {
        writeln!(encoder, "{}", line).unwrap();
    }
    encoder.finish().unwrap();
    path
}

/// Deterministic mixed input: every 7th line Huawei, every 11th China Lake
pub fn mixed_lines(count: usize) -> Vec<String> {
    (1..=count)
        .map(|i| {
            if i % 7 == 0 {
                format!("{} Contract with Huawei Technologies", i)
            } else if i % 11 == 0 {
                format!("{} Shipment via China Lake depot", i)
            } else {
                format!("{} Routine invoice, no entities", i)
            }
        })
        .collect()
}

pub fn run(
    config: &PipelineConfig,
    classifier: &dyn Classifier,
    request: &ScanRequest,
) -> ScanOutcome {
    Scanner::new(config, classifier, StopSignal::new())
        .run(request)
        .unwrap()
}

/// Wraps a classifier and triggers a stop after a fixed number of records
pub struct StopAfter<'a, C: ?Sized> {
    inner: &'a C,
    remaining: AtomicU64,
    stop: StopSignal,
}

impl<'a, C: Classifier + ?Sized> StopAfter<'a, C> {
    pub fn new(inner: &'a C, records: u64, stop: StopSignal) -> Self {
        Self {
            inner,
            remaining: AtomicU64::new(records),
            stop,
        }
    }
}

impl<C: Classifier + ?Sized> Classifier for StopAfter<'_, C> {
    fn classify(&self, record: &Record) -> ClassificationResult {
        let before = self.remaining.fetch_sub(1, Ordering::SeqCst);
        if before <= 1 {
            self.stop.trigger();
        }
        self.inner.classify(record)
    }

    fn name(&self) -> &str {
        "stop_after"
    }
}

/// Classifier that counts calls and matches nothing
#[derive(Default)]
pub struct CountingClassifier {
    calls: AtomicU64,
}

impl CountingClassifier {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for CountingClassifier {
    fn classify(&self, _record: &Record) -> ClassificationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ClassificationResult::unmatched()
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Store that rejects every write
#[derive(Default)]
pub struct BrokenStore {
    pub attempts: u64,
}

impl MatchStore for BrokenStore {
    fn ensure_schema(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_batch(&mut self, batch_id: u64, _rows: &[MatchRow]) -> Result<()> {
        self.attempts += 1;
        Err(Error::sink_write(batch_id, "disk full"))
    }

    fn write_one(&mut self, row: &MatchRow) -> Result<()> {
        self.attempts += 1;
        Err(Error::sink_write(0, format!("line {}: disk full", row.line_number)))
    }

    fn count_by_category(&self, _source: &str) -> Result<Vec<(String, u64)>> {
        Ok(Vec::new())
    }
}
