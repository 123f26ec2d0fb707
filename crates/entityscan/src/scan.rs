//! Single-file scan driver
//!
//! One run moves through `Init → Streaming → [FlushPartial] → Finalize → Done`.
//! `Init` validates configuration and opens the source, store and
//! checkpoint; any failure there aborts before a record is read.
//! `Streaming` classifies and aggregates record by record. A stop signal
//! or a mid-stream source error diverts to `FlushPartial`, which still
//! writes the report (flagged partial), flushes the sink and leaves a
//! checkpoint behind. A clean end of input goes through `Finalize`,
//! which removes the checkpoint.

use crate::settings::PipelineConfig;
use crate::shutdown::StopSignal;
use entityscan_classifiers::Classifier;
use entityscan_core::{estimate_total_records, Error, LineSource, Result, ResumePoint};
use entityscan_telemetry::{
    checkpoint, checkpoint_path, write_json_atomic, AggregateStats, BatchWriter, Checkpoint,
    Counts, MatchRow, MatchStore, MetricsCollector, ProgressTracker, RunMeta, RunReport,
    RunStatus, SqliteStore,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Clean completion
pub const EXIT_OK: i32 = 0;
/// Fatal configuration or I/O error
pub const EXIT_FATAL: i32 = 1;
/// Interrupted; a partial report was written
pub const EXIT_PARTIAL: i32 = 3;

/// Lines sampled to estimate the record count of an input
const ESTIMATE_SAMPLE_LINES: usize = 1000;

/// Pipeline states of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Init,
    Streaming,
    FlushPartial,
    Finalize,
    Done,
}

/// Where a run starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// From the first line, with empty counts
    #[default]
    Fresh,
    /// After the given line, with empty counts; the report covers the rest only
    FromLine(u64),
    /// From the checkpoint next to the report, continuing its counts
    FromCheckpoint,
}

/// Input and output of one run
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub source_id: String,
    pub resume: ResumeMode,
    pub db: Option<PathBuf>,
}

impl ScanRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        let input = input.into();
        Self {
            source_id: default_source_id(&input),
            input,
            output: output.into(),
            resume: ResumeMode::Fresh,
            db: None,
        }
    }

    pub fn with_resume(mut self, resume: ResumeMode) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_db(mut self, db: impl Into<PathBuf>) -> Self {
        self.db = Some(db.into());
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self
    }
}

/// Input file name, used when no source id is given
pub fn default_source_id(input: &Path) -> String {
    input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.display().to_string())
}

/// `<input file name>.report.json` in the working directory
pub fn default_report_path(input: &Path) -> PathBuf {
    PathBuf::from(format!("{}.report.json", default_source_id(input)))
}

/// Result of a run that got past `Init`
#[derive(Debug)]
pub struct ScanOutcome {
    pub report: RunReport,
    pub report_path: PathBuf,
    /// States visited, in order
    pub states: Vec<ScanState>,
    /// Why the run stopped early, if it did
    pub error: Option<Error>,
}

impl ScanOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.report.status {
            RunStatus::Complete => EXIT_OK,
            RunStatus::Interrupted => EXIT_PARTIAL,
            RunStatus::Failed => EXIT_FATAL,
        }
    }

    pub fn visited(&self, state: ScanState) -> bool {
        self.states.contains(&state)
    }
}

/// Runs scans with one configuration and classifier
pub struct Scanner<'a, C: Classifier + ?Sized> {
    config: &'a PipelineConfig,
    classifier: &'a C,
    stop: StopSignal,
}

impl<'a, C: Classifier + ?Sized> Scanner<'a, C> {
    pub fn new(config: &'a PipelineConfig, classifier: &'a C, stop: StopSignal) -> Self {
        Self {
            config,
            classifier,
            stop,
        }
    }

    /// Run, opening the SQLite store named by the request if any
    pub fn run(&self, request: &ScanRequest) -> Result<ScanOutcome> {
        let store = match &request.db {
            Some(path) => Some(SqliteStore::open(path)?),
            None => None,
        };
        self.run_with_store(request, store)
    }

    /// Run with an explicit match store
    pub fn run_with_store<S: MatchStore>(
        &self,
        request: &ScanRequest,
        store: Option<S>,
    ) -> Result<ScanOutcome> {
        let mut states = vec![ScanState::Init];
        debug!(state = ?ScanState::Init, input = %request.input.display());

        self.config.validate()?;
        let scan = &self.config.scan;
        let fingerprint = self.config.fingerprint()?;
        let checkpoint_file = checkpoint_path(&request.output);
        let input_id = request
            .input
            .canonicalize()
            .unwrap_or_else(|_| request.input.clone());

        let (resume, restored) =
            self.resume_point(request, &input_id, &checkpoint_file, &fingerprint)?;

        let mut source = LineSource::open(&request.input, self.config.source.clone(), resume)?;

        let mut writer = match store {
            Some(mut store) => {
                store.ensure_schema()?;
                Some(BatchWriter::new(store, self.config.sink.clone()))
            }
            None => None,
        };

        let expected = match self.config.source.expected_records {
            Some(total) => Some(total),
            None => estimate_total_records(&request.input, ESTIMATE_SAMPLE_LINES).unwrap_or_else(
                |e| {
                    debug!("Could not estimate record count: {}", e);
                    None
                },
            ),
        };

        let mut meta = RunMeta::new(
            request.source_id.as_str(),
            request.input.display().to_string(),
            fingerprint.as_str(),
        );
        meta.resumed_from_line = resume.map(|r| r.line).filter(|&line| line > 0);

        let mut aggregate = AggregateStats::resume(scan.samples.clone(), restored.clone());
        let mut metrics = MetricsCollector::starting_at(restored);
        let mut progress =
            ProgressTracker::new(scan.progress_every_records, scan.progress_interval(), expected);

        info!(
            "Scanning {} ({} groups, config {})",
            request.input.display(),
            self.config.patterns.groups.len(),
            &fingerprint[..12.min(fingerprint.len())]
        );

        states.push(ScanState::Streaming);
        debug!(state = ?ScanState::Streaming);

        let sample_chars = scan.samples.sample_text_chars;
        let mut since_stop_check = scan.stop_check_every;
        let mut next_checkpoint = scan.checkpoint_every_records;
        let mut interrupted = false;
        let mut failure = None;

        loop {
            if since_stop_check >= scan.stop_check_every {
                since_stop_check = 0;
                if self.stop.is_triggered() {
                    interrupted = true;
                    break;
                }

                let records = aggregate.session_records();
                progress.tick(records, source.line());

                if records >= next_checkpoint {
                    while next_checkpoint <= records {
                        next_checkpoint += scan.checkpoint_every_records;
                    }
                    sync_sink(&mut writer, &mut aggregate);
                    aggregate.set_source_stats(source.stats());
                    let counts = aggregate.counts();
                    save_checkpoint(&checkpoint_file, &input_id, &fingerprint, &source, &counts);
                    metrics.publish(&counts);
                }
            }

            let record = match source.next_record() {
                None => break,
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    error!("Input became unreadable after line {}: {}", source.line(), e);
                    failure = Some(e);
                    break;
                }
            };

            let result = self.classifier.classify(&record);
            if let Some(writer) = writer.as_mut() {
                if let Some(row) = MatchRow::from_result(
                    &request.source_id,
                    &meta.run_id,
                    &record,
                    &result,
                    sample_chars,
                ) {
                    writer.push(row);
                }
            }
            aggregate.record_result(&record, &result);
            since_stop_check += 1;
        }

        sync_sink(&mut writer, &mut aggregate);
        drop(writer);
        aggregate.set_source_stats(source.stats());

        let error = if interrupted {
            Some(Error::Interrupted { line: source.line() })
        } else {
            failure
        };

        let report = match &error {
            Some(err) => {
                states.push(ScanState::FlushPartial);
                debug!(state = ?ScanState::FlushPartial);

                meta.status = if interrupted {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Failed
                };
                meta.error = Some(err.to_string());

                let report = aggregate.finalize(&meta);
                write_json_atomic(&request.output, &report)?;
                save_checkpoint(
                    &checkpoint_file,
                    &input_id,
                    &fingerprint,
                    &source,
                    &report.counts,
                );
                warn!(
                    "Wrote partial report {} after line {} ({})",
                    request.output.display(),
                    source.line(),
                    err
                );
                report
            }
            None => {
                states.push(ScanState::Finalize);
                debug!(state = ?ScanState::Finalize);

                let report = aggregate.finalize(&meta);
                write_json_atomic(&request.output, &report)?;
                if let Err(e) = checkpoint::clear(&checkpoint_file) {
                    warn!("Could not remove checkpoint {}: {}", checkpoint_file.display(), e);
                }
                info!(
                    "Wrote report {} ({} records, {} matches)",
                    request.output.display(),
                    report.counts.total_records,
                    report.counts.total_matches
                );
                report
            }
        };

        metrics.publish(&report.counts);
        metrics.record_duration(Duration::from_secs_f64(report.processing_time_seconds));

        states.push(ScanState::Done);
        debug!(state = ?ScanState::Done);

        Ok(ScanOutcome {
            report,
            report_path: request.output.clone(),
            states,
            error,
        })
    }

    fn resume_point(
        &self,
        request: &ScanRequest,
        input_id: &Path,
        checkpoint_file: &Path,
        fingerprint: &str,
    ) -> Result<(Option<ResumePoint>, Counts)> {
        match request.resume {
            ResumeMode::Fresh | ResumeMode::FromLine(0) => Ok((None, Counts::default())),
            ResumeMode::FromLine(line) => {
                info!("Resuming after line {}", line);
                Ok((Some(ResumePoint::after_line(line)), Counts::default()))
            }
            ResumeMode::FromCheckpoint => match Checkpoint::load(checkpoint_file)? {
                Some(saved) => {
                    saved.verify(input_id, fingerprint)?;
                    info!(
                        "Resuming from checkpoint after line {} ({} records already counted)",
                        saved.line, saved.counts.total_records
                    );
                    Ok((Some(saved.resume_point()), saved.counts))
                }
                None => {
                    warn!(
                        "No checkpoint at {}, starting from the beginning",
                        checkpoint_file.display()
                    );
                    Ok((None, Counts::default()))
                }
            },
        }
    }
}

/// Flush buffered rows and move their failures into the counts
fn sync_sink<S: MatchStore>(writer: &mut Option<BatchWriter<S>>, aggregate: &mut AggregateStats) {
    if let Some(writer) = writer.as_mut() {
        writer.flush();
        aggregate.add_failed_writes(writer.take_failed_writes());
    }
}

fn save_checkpoint(
    path: &Path,
    input: &Path,
    fingerprint: &str,
    source: &LineSource,
    counts: &Counts,
) {
    let saved = Checkpoint::new(
        input,
        fingerprint,
        source.line(),
        source.byte_offset(),
        counts.clone(),
    );
    match saved.save(path) {
        Ok(()) => debug!("Checkpoint at line {}", source.line()),
        Err(e) => warn!("Failed to write checkpoint {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let input = Path::new("/data/usaspending/contracts_2023.tsv.gz");
        assert_eq!(default_source_id(input), "contracts_2023.tsv.gz");
        assert_eq!(
            default_report_path(input),
            PathBuf::from("contracts_2023.tsv.gz.report.json")
        );
    }

    #[test]
    fn test_request_builder() {
        let request = ScanRequest::new("in.txt", "out.json")
            .with_resume(ResumeMode::FromLine(10))
            .with_db("matches.sqlite")
            .with_source_id("ted");
        assert_eq!(request.resume, ResumeMode::FromLine(10));
        assert_eq!(request.db, Some(PathBuf::from("matches.sqlite")));
        assert_eq!(request.source_id, "ted");
    }
}
