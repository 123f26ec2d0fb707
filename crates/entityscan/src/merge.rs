//! Combine per-file or per-segment reports (and store shards) into one

use entityscan_core::{Error, Result};
use entityscan_telemetry::{read_report, write_json_atomic, MatchStore, RunReport, SqliteStore};
use std::path::{Path, PathBuf};
use tracing::info;

/// What to merge and where
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub reports: Vec<PathBuf>,
    pub output: PathBuf,
    pub shards: Vec<PathBuf>,
    pub db: Option<PathBuf>,
}

/// Sum the reports, write the merged report and union any shards
pub fn run_merge(request: &MergeRequest) -> Result<RunReport> {
    let reports = request
        .reports
        .iter()
        .map(read_report)
        .collect::<Result<Vec<_>>>()?;

    let merged = RunReport::merge(&reports)?;
    write_json_atomic(&request.output, &merged)?;
    info!(
        "Merged {} reports into {} ({} records)",
        reports.len(),
        request.output.display(),
        merged.counts.total_records
    );

    if !request.shards.is_empty() {
        let db = request
            .db
            .as_deref()
            .ok_or_else(|| Error::config("--shards needs --db"))?;
        merge_shards(db, &request.shards)?;
    }

    Ok(merged)
}

/// Union store shards into `db`; returns rows copied
pub fn merge_shards(db: &Path, shards: &[PathBuf]) -> Result<u64> {
    let mut store = SqliteStore::open(db)?;
    store.ensure_schema()?;

    let mut copied = 0;
    for shard in shards {
        copied += store.absorb(shard)?;
    }
    info!(
        "Merged {} shards into {} ({} rows)",
        shards.len(),
        db.display(),
        copied
    );
    Ok(copied)
}
