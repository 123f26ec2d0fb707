//! Parallel scans of many inputs
//!
//! Every input runs in its own `entityscan scan` child process, so a crash
//! or runaway file takes down one worker only. At most `jobs` children run
//! at once. Each child writes its own report, checkpoint and (optionally)
//! SQLite shard into the output directory; `entityscan merge` combines
//! them afterwards.

use crate::cli::{BatchArgs, SourceArgs};
use crate::scan::{EXIT_FATAL, EXIT_OK, EXIT_PARTIAL};
use crate::shutdown::StopSignal;
use chrono::{DateTime, Utc};
use entityscan_core::{Error, Result};
use entityscan_telemetry::write_json_atomic;
use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub const SUMMARY_FILE: &str = "batch_summary.json";

/// Everything needed to launch the workers
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub jobs: usize,
    pub timeout: Option<Duration>,
    pub db_shards: bool,
    pub resume: bool,
    /// Extra flags passed to every worker
    pub worker_flags: Vec<String>,
    /// Executable run as `<program> scan ...`
    pub program: PathBuf,
}

impl BatchRequest {
    /// Resolve globs and worker settings from the command line
    pub fn from_args(args: &BatchArgs, verbose: bool, json_logs: bool) -> Result<Self> {
        let inputs = discover_inputs(&args.inputs)?;
        let program = std::env::current_exe()
            .map_err(|e| Error::internal(format!("cannot locate own executable: {}", e)))?;

        let mut worker_flags = source_flags(&args.source);
        if verbose {
            worker_flags.push("--verbose".to_string());
        }
        if json_logs {
            worker_flags.push("--json-logs".to_string());
        }

        Ok(Self {
            inputs,
            output_dir: args.output_dir.clone(),
            config: args.config.clone(),
            jobs: args.jobs.unwrap_or_else(num_cpus::get).max(1),
            timeout: args.timeout_secs.map(Duration::from_secs),
            db_shards: args.db_shards,
            resume: args.resume,
            worker_flags,
            program,
        })
    }
}

/// Files matching any of the patterns, sorted and deduplicated
///
/// A pattern naming an existing file is taken as is. Otherwise it is a
/// glob (`*` stays within one directory, `**` crosses directories) walked
/// from its longest literal directory prefix.
pub fn discover_inputs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();

    for pattern in patterns {
        if Path::new(pattern).is_file() {
            found.insert(PathBuf::from(pattern));
            continue;
        }

        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| Error::config(format!("invalid input pattern '{}': {}", pattern, e)))?
            .compile_matcher();

        let base = literal_prefix(pattern);
        let walk_root = if base.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            base.clone()
        };

        let before = found.len();
        for entry in WalkDir::new(&walk_root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable path while expanding '{}': {}", pattern, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = if base.as_os_str().is_empty() {
                entry.path().strip_prefix(".").unwrap_or(entry.path())
            } else {
                entry.path()
            };
            if matcher.is_match(path) {
                found.insert(path.to_path_buf());
            }
        }

        if found.len() == before {
            warn!("Input pattern '{}' matched no files", pattern);
        }
    }

    if found.is_empty() {
        return Err(Error::config(format!(
            "no input files match {}",
            patterns.join(", ")
        )));
    }
    Ok(found.into_iter().collect())
}

/// Leading path components that contain no glob syntax
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    let mut components = Path::new(pattern).components().peekable();
    while let Some(component) = components.next() {
        // The last component is the file name part of the pattern
        if components.peek().is_none() {
            break;
        }
        let text = component.as_os_str().to_string_lossy();
        if text.contains(['*', '?', '[', '{']) {
            break;
        }
        prefix.push(component);
    }
    prefix
}

/// CLI flags reproducing the source overrides for a worker
pub fn source_flags(source: &SourceArgs) -> Vec<String> {
    let mut flags = Vec::new();
    let mut push = |flag: &str, value: Option<String>| {
        if let Some(value) = value {
            flags.push(flag.to_string());
            flags.push(value);
        }
    };

    push("--encoding", source.encoding.as_ref().and_then(serde_name));
    push("--on-decode-error", source.on_decode_error.as_ref().and_then(serde_name));
    push("--format", source.format.as_ref().and_then(serde_name));
    push("--compression", source.compression.as_ref().and_then(serde_name));
    push(
        "--expected-records",
        source.expected_records.map(|n| n.to_string()),
    );
    if !source.fields.is_empty() {
        push("--fields", Some(source.fields.join(",")));
    }
    if source.no_header {
        flags.push("--no-header".to_string());
    }
    flags
}

fn serde_name<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => Some(name),
        _ => None,
    }
}

/// One input and where its outputs go
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    pub input: PathBuf,
    /// Source id for the report and store; unique within the batch
    pub source_id: String,
    pub report: PathBuf,
    pub db: Option<PathBuf>,
}

impl WorkerPlan {
    /// Arguments after the program name
    pub fn args(&self, request: &BatchRequest) -> Vec<String> {
        let mut args = vec![
            "scan".to_string(),
            "--input".to_string(),
            self.input.display().to_string(),
            "--output".to_string(),
            self.report.display().to_string(),
            "--source-id".to_string(),
            self.source_id.clone(),
        ];
        if let Some(config) = &request.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        if let Some(db) = &self.db {
            args.push("--db".to_string());
            args.push(db.display().to_string());
        }
        if request.resume {
            args.push("--resume".to_string());
        }
        args.extend(request.worker_flags.iter().cloned());
        args
    }
}

/// Output paths per input; inputs sharing a file name get numbered suffixes
pub fn plan_workers(inputs: &[PathBuf], output_dir: &Path, db_shards: bool) -> Vec<WorkerPlan> {
    let mut seen: HashMap<String, usize> = HashMap::new();

    inputs
        .iter()
        .map(|input| {
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string());
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            let stem = if *count == 1 {
                name
            } else {
                format!("{}-{}", name, count)
            };

            WorkerPlan {
                input: input.clone(),
                report: output_dir.join(format!("{}.report.json", stem)),
                db: db_shards.then(|| output_dir.join(format!("{}.sqlite", stem))),
                source_id: stem,
            }
        })
        .collect()
}

/// How a worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Complete,
    Partial,
    Failed,
    TimedOut,
    SpawnFailed,
    /// Never started because the batch was stopped
    Skipped,
}

impl WorkerStatus {
    fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(EXIT_OK) => Self::Complete,
            Some(EXIT_PARTIAL) => Self::Partial,
            _ => Self::Failed,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::SpawnFailed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub input: PathBuf,
    pub report: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<PathBuf>,
    pub status: WorkerStatus,
    pub exit_code: Option<i32>,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResult {
    fn new(plan: WorkerPlan, status: WorkerStatus, exit_code: Option<i32>, started: Instant) -> Self {
        Self {
            input: plan.input,
            report: plan.report,
            db: plan.db,
            status,
            exit_code,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            error: None,
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Written to `batch_summary.json` in the output directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: usize,
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub workers: Vec<WorkerResult>,
}

impl BatchSummary {
    fn new(started_at: DateTime<Utc>, jobs: usize, mut workers: Vec<WorkerResult>) -> Self {
        workers.sort_by(|a, b| a.input.cmp(&b.input));
        let count = |pred: fn(&WorkerStatus) -> bool| {
            workers.iter().filter(|w| pred(&w.status)).count()
        };
        Self {
            started_at,
            finished_at: Utc::now(),
            jobs,
            complete: count(|s| *s == WorkerStatus::Complete),
            partial: count(|s| *s == WorkerStatus::Partial),
            failed: count(WorkerStatus::is_failure),
            skipped: count(|s| *s == WorkerStatus::Skipped),
            workers,
        }
    }

    /// 1 if any worker failed, else 3 if any is partial or skipped, else 0
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            EXIT_FATAL
        } else if self.partial > 0 || self.skipped > 0 {
            EXIT_PARTIAL
        } else {
            EXIT_OK
        }
    }

    /// Completed reports, for merging
    pub fn reports(&self) -> Vec<PathBuf> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Complete)
            .map(|w| w.report.clone())
            .collect()
    }
}

/// Run every input, at most `jobs` at a time, and write the batch summary
pub async fn run_batch(request: BatchRequest, stop: StopSignal) -> Result<BatchSummary> {
    let started_at = Utc::now();
    std::fs::create_dir_all(&request.output_dir)?;

    let plans = plan_workers(&request.inputs, &request.output_dir, request.db_shards);
    info!(
        "Scanning {} inputs with {} workers into {}",
        plans.len(),
        request.jobs,
        request.output_dir.display()
    );

    let semaphore = Arc::new(Semaphore::new(request.jobs));
    let request = Arc::new(request);
    let mut handles = Vec::with_capacity(plans.len());
    let mut results = Vec::with_capacity(plans.len());

    for plan in plans {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::internal(format!("worker pool closed: {}", e)))?;

        if stop.is_triggered() {
            info!("Stop requested, not starting {}", plan.input.display());
            results.push(WorkerResult::new(plan, WorkerStatus::Skipped, None, Instant::now()));
            continue;
        }

        let request = request.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            run_worker(&request, plan).await
        }));
    }

    for joined in futures::future::join_all(handles).await {
        let result = joined.map_err(|e| Error::internal(format!("worker task failed: {}", e)))?;
        results.push(result);
    }

    let summary = BatchSummary::new(started_at, request.jobs, results);
    write_json_atomic(request.output_dir.join(SUMMARY_FILE), &summary)?;
    info!(
        "Batch finished: {} complete, {} partial, {} failed, {} skipped",
        summary.complete, summary.partial, summary.failed, summary.skipped
    );
    Ok(summary)
}

async fn run_worker(request: &BatchRequest, plan: WorkerPlan) -> WorkerResult {
    let started = Instant::now();
    let mut command = Command::new(&request.program);
    command
        .args(plan.args(request))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);

    info!("Worker started for {}", plan.input.display());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("Cannot start worker for {}: {}", plan.input.display(), e);
            return WorkerResult::new(plan, WorkerStatus::SpawnFailed, None, started)
                .with_error(e.to_string());
        }
    };

    let waited = match request.timeout {
        Some(limit) => {
            let outcome = tokio::time::timeout(limit, child.wait()).await;
            match outcome {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(
                        "Worker for {} exceeded {:?}, killing it",
                        plan.input.display(),
                        limit
                    );
                    if let Err(e) = child.kill().await {
                        warn!("Could not kill worker: {}", e);
                    }
                    return WorkerResult::new(plan, WorkerStatus::TimedOut, None, started)
                        .with_error(format!("timed out after {}s", limit.as_secs()));
                }
            }
        }
        None => child.wait().await,
    };

    match waited {
        Ok(exit) => {
            let code = exit.code();
            let status = WorkerStatus::from_exit_code(code);
            match status {
                WorkerStatus::Complete => info!("Worker for {} finished", plan.input.display()),
                WorkerStatus::Partial => warn!("Worker for {} stopped early", plan.input.display()),
                _ => error!("Worker for {} failed ({})", plan.input.display(), exit),
            }
            let result = WorkerResult::new(plan, status, code, started);
            if status.is_failure() {
                result.with_error(format!("worker exited with {}", exit))
            } else {
                result
            }
        }
        Err(e) => {
            error!("Lost worker for {}: {}", plan.input.display(), e);
            WorkerResult::new(plan, WorkerStatus::Failed, None, started).with_error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entityscan_core::InputFormat;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x\n").unwrap();
    }

    #[test]
    fn test_discover_globs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("a.tsv"));
        touch(&root.join("b.tsv.gz"));
        touch(&root.join("notes.md"));
        touch(&root.join("2023/c.tsv"));

        let flat = format!("{}/*.tsv", root.display());
        assert_eq!(discover_inputs(&[flat]).unwrap(), vec![root.join("a.tsv")]);

        let deep = format!("{}/**/*.tsv", root.display());
        let gz = format!("{}/*.gz", root.display());
        let found = discover_inputs(&[deep, gz]).unwrap();
        assert_eq!(
            found,
            vec![root.join("2023/c.tsv"), root.join("a.tsv"), root.join("b.tsv.gz")]
        );
    }

    #[test]
    fn test_discover_plain_paths_and_duplicates() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        touch(&file);

        let name = file.display().to_string();
        let found = discover_inputs(&[name.clone(), name]).unwrap();
        assert_eq!(found, vec![file]);
    }

    #[test]
    fn test_discover_nothing_is_an_error() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/*.tsv", dir.path().display());
        assert!(discover_inputs(&[pattern]).unwrap_err().is_configuration());
    }

    #[test]
    fn test_literal_prefix() {
        assert_eq!(literal_prefix("data/2023/*.tsv"), PathBuf::from("data/2023"));
        assert_eq!(literal_prefix("data/**/x.gz"), PathBuf::from("data"));
        assert_eq!(literal_prefix("*.tsv"), PathBuf::new());
    }

    #[test]
    fn test_plan_dedupes_names() {
        let inputs = vec![
            PathBuf::from("2022/contracts.tsv"),
            PathBuf::from("2023/contracts.tsv"),
            PathBuf::from("grants.tsv"),
        ];
        let plans = plan_workers(&inputs, Path::new("out"), true);

        assert_eq!(plans[0].report, PathBuf::from("out/contracts.tsv.report.json"));
        assert_eq!(plans[1].report, PathBuf::from("out/contracts.tsv-2.report.json"));
        assert_eq!(plans[1].db, Some(PathBuf::from("out/contracts.tsv-2.sqlite")));
        assert_eq!(plans[2].report, PathBuf::from("out/grants.tsv.report.json"));
        assert_eq!(plans[1].source_id, "contracts.tsv-2");

        let no_shards = plan_workers(&inputs, Path::new("out"), false);
        assert!(no_shards.iter().all(|p| p.db.is_none()));
    }

    #[test]
    fn test_worker_args() {
        let source = SourceArgs {
            format: Some(InputFormat::Tsv),
            fields: vec!["recipient_name".to_string(), "3".to_string()],
            no_header: true,
            ..SourceArgs::default()
        };
        let request = BatchRequest {
            inputs: vec![],
            output_dir: PathBuf::from("out"),
            config: Some(PathBuf::from("patterns.yaml")),
            jobs: 2,
            timeout: None,
            db_shards: true,
            resume: true,
            worker_flags: source_flags(&source),
            program: PathBuf::from("entityscan"),
        };
        let plan = &plan_workers(&[PathBuf::from("a.tsv")], &request.output_dir, true)[0];

        let args = plan.args(&request);
        assert_eq!(
            args,
            vec![
                "scan",
                "--input",
                "a.tsv",
                "--output",
                "out/a.tsv.report.json",
                "--source-id",
                "a.tsv",
                "--config",
                "patterns.yaml",
                "--db",
                "out/a.tsv.sqlite",
                "--resume",
                "--format",
                "tsv",
                "--fields",
                "recipient_name,3",
                "--no-header",
            ]
        );
    }

    #[test]
    fn test_summary_exit_code() {
        let result = |status| WorkerResult {
            input: PathBuf::from("a"),
            report: PathBuf::from("a.report.json"),
            db: None,
            status,
            exit_code: None,
            elapsed_seconds: 0.0,
            error: None,
        };

        let ok = BatchSummary::new(Utc::now(), 1, vec![result(WorkerStatus::Complete)]);
        assert_eq!(ok.exit_code(), EXIT_OK);
        assert_eq!(ok.reports(), vec![PathBuf::from("a.report.json")]);

        let partial = BatchSummary::new(
            Utc::now(),
            1,
            vec![result(WorkerStatus::Complete), result(WorkerStatus::Skipped)],
        );
        assert_eq!(partial.exit_code(), EXIT_PARTIAL);

        let failed = BatchSummary::new(
            Utc::now(),
            1,
            vec![result(WorkerStatus::Partial), result(WorkerStatus::TimedOut)],
        );
        assert_eq!(failed.failed, 1);
        assert_eq!(failed.exit_code(), EXIT_FATAL);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        touch(&input);

        let request = BatchRequest {
            inputs: vec![input],
            output_dir: dir.path().join("out"),
            config: None,
            jobs: 1,
            timeout: None,
            db_shards: false,
            resume: false,
            worker_flags: Vec::new(),
            program: dir.path().join("no-such-binary"),
        };
        let summary = run_batch(request, StopSignal::new()).await.unwrap();

        assert_eq!(summary.workers[0].status, WorkerStatus::SpawnFailed);
        assert_eq!(summary.exit_code(), EXIT_FATAL);
        assert!(dir.path().join("out").join(SUMMARY_FILE).exists());
    }

    #[tokio::test]
    async fn test_stopped_batch_skips_workers() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        touch(&input);

        let stop = StopSignal::new();
        stop.trigger();
        let request = BatchRequest {
            inputs: vec![input],
            output_dir: dir.path().join("out"),
            config: None,
            jobs: 1,
            timeout: None,
            db_shards: false,
            resume: false,
            worker_flags: Vec::new(),
            program: dir.path().join("no-such-binary"),
        };
        let summary = run_batch(request, stop).await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.exit_code(), EXIT_PARTIAL);
    }
}
