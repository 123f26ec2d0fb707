//! Structured match store and batched writer
//!
//! The store only needs three capabilities: create its table if missing,
//! insert-or-replace rows keyed by `(source, line_number)`, and count rows
//! per category. [`SqliteStore`] provides them over rusqlite in WAL mode.

use entityscan_core::{ClassificationResult, Error, Record, Result, RiskTier};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::aggregate::truncate_chars;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity_matches (
    source TEXT NOT NULL,
    line_number INTEGER NOT NULL,
    category TEXT NOT NULL,
    risk_tier TEXT NOT NULL,
    group_name TEXT NOT NULL,
    matched_pattern TEXT NOT NULL,
    confidence REAL NOT NULL,
    text TEXT NOT NULL,
    run_id TEXT NOT NULL,
    detected_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (source, line_number)
);

CREATE INDEX IF NOT EXISTS idx_entity_matches_category ON entity_matches(source, category);
CREATE INDEX IF NOT EXISTS idx_entity_matches_tier ON entity_matches(risk_tier);
"#;

const INSERT_ROW: &str = "INSERT OR REPLACE INTO entity_matches
    (source, line_number, category, risk_tier, group_name, matched_pattern, confidence, text, run_id)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

/// One matched record as stored
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRow {
    pub source: String,
    pub line_number: u64,
    pub category: String,
    pub risk_tier: RiskTier,
    pub group: String,
    pub matched_pattern: String,
    pub confidence: f32,
    pub text: String,
    pub run_id: String,
}

impl MatchRow {
    /// Row for a matched record; `None` for excluded or unmatched records
    pub fn from_result(
        source: &str,
        run_id: &str,
        record: &Record,
        result: &ClassificationResult,
        text_chars: usize,
    ) -> Option<Self> {
        if !result.matched {
            return None;
        }
        Some(Self {
            source: source.to_string(),
            line_number: record.line_number,
            category: result.category.clone()?,
            risk_tier: result.risk_tier.unwrap_or_default(),
            group: result.group.clone().unwrap_or_default(),
            matched_pattern: result.matched_pattern.clone().unwrap_or_default(),
            confidence: result.confidence,
            text: truncate_chars(&record.raw_text, text_chars).to_string(),
            run_id: run_id.to_string(),
        })
    }
}

/// Structured sink for matched records
pub trait MatchStore: Send {
    /// Create the match table if it does not exist
    fn ensure_schema(&mut self) -> Result<()>;

    /// Insert all rows in one transaction; all or nothing
    fn write_batch(&mut self, batch_id: u64, rows: &[MatchRow]) -> Result<()>;

    /// Insert one row on its own
    fn write_one(&mut self, row: &MatchRow) -> Result<()>;

    /// Rows per category for a source, largest first
    fn count_by_category(&self, source: &str) -> Result<Vec<(String, u64)>>;
}

/// SQLite-backed match store
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create a store file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::store(format!("cannot open {}: {}", path.display(), e)))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| Error::store(format!("cannot configure {}: {}", path.display(), e)))?;

        info!("Opened match store {}", path.display());
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Store that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::store(e.to_string()))?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy every row of another store file into this one, replacing rows
    /// with the same `(source, line_number)`
    pub fn absorb(&mut self, shard: impl AsRef<Path>) -> Result<u64> {
        let shard = shard.as_ref();
        if !shard.is_file() {
            return Err(Error::store(format!("no store at {}", shard.display())));
        }
        let name = shard
            .to_str()
            .ok_or_else(|| Error::store(format!("non UTF-8 path {}", shard.display())))?;
        let to_err =
            |e: rusqlite::Error| Error::store(format!("cannot merge {}: {}", shard.display(), e));

        self.conn
            .execute("ATTACH DATABASE ?1 AS shard", params![name])
            .map_err(to_err)?;
        let copied = self.conn.execute(
            "INSERT OR REPLACE INTO entity_matches SELECT * FROM shard.entity_matches",
            [],
        );
        let detached = self.conn.execute("DETACH DATABASE shard", []);

        let copied = copied.map_err(to_err)?;
        detached.map_err(to_err)?;
        debug!("Merged {} rows from {}", copied, shard.display());
        Ok(copied as u64)
    }

    fn insert(conn: &Connection, row: &MatchRow) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(INSERT_ROW)?;
        stmt.execute(params![
            row.source,
            row.line_number as i64,
            row.category,
            row.risk_tier.as_str(),
            row.group,
            row.matched_pattern,
            row.confidence as f64,
            row.text,
            row.run_id,
        ])
    }
}

impl MatchStore for SqliteStore {
    fn ensure_schema(&mut self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .map_err(|e| Error::store(format!("cannot create schema: {}", e)))
    }

    fn write_batch(&mut self, batch_id: u64, rows: &[MatchRow]) -> Result<()> {
        let to_err = |e: rusqlite::Error| Error::sink_write(batch_id, e.to_string());

        let tx = self.conn.transaction().map_err(to_err)?;
        for row in rows {
            Self::insert(&tx, row).map_err(to_err)?;
        }
        tx.commit().map_err(to_err)
    }

    fn write_one(&mut self, row: &MatchRow) -> Result<()> {
        Self::insert(&self.conn, row)
            .map(|_| ())
            .map_err(|e| Error::sink_write(0, format!("line {}: {}", row.line_number, e)))
    }

    fn count_by_category(&self, source: &str) -> Result<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT category, COUNT(*) FROM entity_matches
                 WHERE source = ?1
                 GROUP BY category
                 ORDER BY COUNT(*) DESC, category ASC",
            )
            .map_err(|e| Error::store(e.to_string()))?;

        let rows = stmt
            .query_map(params![source], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(|e| Error::store(e.to_string()))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::store(e.to_string()))
    }
}

/// What to do when a batch insert fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnWriteError {
    /// Retry the batch, then fall back to row-by-row writes
    #[default]
    Retry,
    /// Go straight to row-by-row writes
    Skip,
}

/// Batching and failure policy for the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritePolicy {
    /// Matched rows per transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub on_error: OnWriteError,

    /// Batch retries before falling back to single rows
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retries, multiplied by the attempt number
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            on_error: OnWriteError::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    50
}

impl WritePolicy {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10_000).contains(&self.batch_size) {
            return Err(Error::config(format!(
                "sink.batch_size must be between 1 and 10000, got {}",
                self.batch_size
            )));
        }
        Ok(())
    }
}

/// Buffers matched rows and writes them in transactions
///
/// A failing batch never aborts the run. Rows that cannot be written even
/// one at a time are counted as failed writes.
pub struct BatchWriter<S: MatchStore> {
    store: S,
    policy: WritePolicy,
    buffer: Vec<MatchRow>,
    next_batch: u64,
    rows_written: u64,
    failed_rows: u64,
    unreported_failures: u64,
}

impl<S: MatchStore> BatchWriter<S> {
    pub fn new(store: S, policy: WritePolicy) -> Self {
        Self {
            buffer: Vec::with_capacity(policy.batch_size),
            store,
            policy,
            next_batch: 1,
            rows_written: 0,
            failed_rows: 0,
            unreported_failures: 0,
        }
    }

    /// Queue a row, flushing when the batch is full
    pub fn push(&mut self, row: MatchRow) {
        self.buffer.push(row);
        if self.buffer.len() >= self.policy.batch_size {
            self.flush();
        }
    }

    /// Write whatever is buffered
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let rows = std::mem::take(&mut self.buffer);
        let batch_id = self.next_batch;
        self.next_batch += 1;

        match self.write_with_retries(batch_id, &rows) {
            Ok(()) => {
                self.rows_written += rows.len() as u64;
                debug!("Batch {} wrote {} rows", batch_id, rows.len());
            }
            Err(e) => {
                warn!(
                    "Batch {} of {} rows failed ({}); writing rows individually",
                    batch_id,
                    rows.len(),
                    e
                );
                self.write_individually(batch_id, &rows);
            }
        }

        self.buffer = rows;
        self.buffer.clear();
    }

    fn write_with_retries(&mut self, batch_id: u64, rows: &[MatchRow]) -> Result<()> {
        let retries = match self.policy.on_error {
            OnWriteError::Retry => self.policy.max_retries,
            OnWriteError::Skip => 0,
        };

        let mut attempt = 0;
        loop {
            match self.store.write_batch(batch_id, rows) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    debug!("Batch {} attempt {} failed: {}", batch_id, attempt, e);
                    std::thread::sleep(Duration::from_millis(
                        self.policy.retry_backoff_ms * attempt as u64,
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_individually(&mut self, batch_id: u64, rows: &[MatchRow]) {
        for row in rows {
            match self.store.write_one(row) {
                Ok(()) => self.rows_written += 1,
                Err(e) => {
                    self.failed_rows += 1;
                    self.unreported_failures += 1;
                    warn!(
                        "Batch {}: dropped line {} ({}): {}",
                        batch_id, row.line_number, row.category, e
                    );
                }
            }
        }
    }

    /// Failed rows since the last call
    pub fn take_failed_writes(&mut self) -> u64 {
        std::mem::take(&mut self.unreported_failures)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn failed_rows(&self) -> u64 {
        self.failed_rows
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Flush and hand back the store
    pub fn finish(mut self) -> S {
        self.flush();
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn row(line: u64, category: &str) -> MatchRow {
        MatchRow {
            source: "usaspending".to_string(),
            line_number: line,
            category: category.to_string(),
            risk_tier: RiskTier::High,
            group: "g".to_string(),
            matched_pattern: "huawei".to_string(),
            confidence: 1.0,
            text: format!("line {}", line),
            run_id: "run_test".to_string(),
        }
    }

    /// Store whose batches fail whenever they contain a poisoned line
    struct FlakyStore {
        poisoned: Vec<u64>,
        written: Vec<u64>,
        batch_calls: Arc<AtomicU32>,
    }

    impl MatchStore for FlakyStore {
        fn ensure_schema(&mut self) -> Result<()> {
            Ok(())
        }

        fn write_batch(&mut self, batch_id: u64, rows: &[MatchRow]) -> Result<()> {
            self.batch_calls.fetch_add(1, Ordering::Relaxed);
            if rows.iter().any(|r| self.poisoned.contains(&r.line_number)) {
                return Err(Error::sink_write(batch_id, "constraint failed"));
            }
            self.written.extend(rows.iter().map(|r| r.line_number));
            Ok(())
        }

        fn write_one(&mut self, row: &MatchRow) -> Result<()> {
            if self.poisoned.contains(&row.line_number) {
                return Err(Error::sink_write(0, "constraint failed"));
            }
            self.written.push(row.line_number);
            Ok(())
        }

        fn count_by_category(&self, _source: &str) -> Result<Vec<(String, u64)>> {
            Ok(Vec::new())
        }
    }

    fn flaky(poisoned: Vec<u64>) -> (FlakyStore, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            FlakyStore {
                poisoned,
                written: Vec::new(),
                batch_calls: calls.clone(),
            },
            calls,
        )
    }

    #[test]
    fn test_sqlite_insert_or_replace_and_count() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        store.ensure_schema().unwrap();

        store
            .write_batch(1, &[row(1, "company"), row(2, "company"), row(3, "location")])
            .unwrap();
        // Same natural key replaces instead of duplicating
        store.write_one(&row(2, "company")).unwrap();

        let counts = store.count_by_category("usaspending").unwrap();
        assert_eq!(
            counts,
            vec![("company".to_string(), 2), ("location".to_string(), 1)]
        );
        assert!(store.count_by_category("other").unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_file_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shards").join("a.sqlite");

        let mut store = SqliteStore::open(&path).unwrap();
        store.ensure_schema().unwrap();
        let mut writer = BatchWriter::new(store, WritePolicy::default());
        for line in 1..=1200 {
            writer.push(row(line, "company"));
        }
        assert_eq!(writer.pending(), 200);
        let store = writer.finish();

        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(
            store.count_by_category("usaspending").unwrap(),
            vec![("company".to_string(), 1200)]
        );
    }

    #[test]
    fn test_absorb_shards() {
        let dir = tempfile::TempDir::new().unwrap();
        let shard_a = dir.path().join("a.sqlite");
        let shard_b = dir.path().join("b.sqlite");

        let mut a = SqliteStore::open(&shard_a).unwrap();
        a.ensure_schema().unwrap();
        a.write_batch(1, &[row(1, "company"), row(2, "company")]).unwrap();
        drop(a);

        let mut b = SqliteStore::open(&shard_b).unwrap();
        b.ensure_schema().unwrap();
        b.write_batch(1, &[row(2, "company"), row(3, "location")]).unwrap();
        drop(b);

        let mut merged = SqliteStore::open(dir.path().join("merged.sqlite")).unwrap();
        merged.ensure_schema().unwrap();
        assert_eq!(merged.absorb(&shard_a).unwrap(), 2);
        assert_eq!(merged.absorb(&shard_b).unwrap(), 2);

        // Line 2 appears in both shards and is stored once
        assert_eq!(
            merged.count_by_category("usaspending").unwrap(),
            vec![("company".to_string(), 2), ("location".to_string(), 1)]
        );

        assert!(merged.absorb(dir.path().join("missing.sqlite")).is_err());
    }

    #[test]
    fn test_batch_writer_flushes_at_batch_size() {
        let (store, calls) = flaky(vec![]);
        let policy = WritePolicy {
            batch_size: 3,
            ..WritePolicy::default()
        };
        let mut writer = BatchWriter::new(store, policy);
        for line in 1..=7 {
            writer.push(row(line, "company"));
        }
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(writer.pending(), 1);

        let store = writer.finish();
        assert_eq!(store.written, (1..=7).collect::<Vec<_>>());
    }

    #[test]
    fn test_failed_batch_retries_then_falls_back_to_rows() {
        let (store, calls) = flaky(vec![2]);
        let policy = WritePolicy {
            batch_size: 3,
            on_error: OnWriteError::Retry,
            max_retries: 2,
            retry_backoff_ms: 0,
        };
        let mut writer = BatchWriter::new(store, policy);
        for line in 1..=3 {
            writer.push(row(line, "company"));
        }

        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(writer.rows_written(), 2);
        assert_eq!(writer.failed_rows(), 1);
        assert_eq!(writer.take_failed_writes(), 1);
        assert_eq!(writer.take_failed_writes(), 0);
        assert_eq!(writer.store().written, vec![1, 3]);
    }

    #[test]
    fn test_skip_policy_does_not_retry() {
        let (store, calls) = flaky(vec![1]);
        let policy = WritePolicy {
            batch_size: 2,
            on_error: OnWriteError::Skip,
            max_retries: 5,
            retry_backoff_ms: 0,
        };
        let mut writer = BatchWriter::new(store, policy);
        writer.push(row(1, "company"));
        writer.push(row(2, "company"));

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(writer.failed_rows(), 1);
        assert_eq!(writer.rows_written(), 1);
    }

    #[test]
    fn test_policy_validation() {
        assert!(WritePolicy::default().validate().is_ok());
        let zero = WritePolicy {
            batch_size: 0,
            ..WritePolicy::default()
        };
        assert!(zero.validate().unwrap_err().is_configuration());
        let huge = WritePolicy {
            batch_size: 10_001,
            ..WritePolicy::default()
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_match_row_only_for_matches() {
        let record = Record::new(7, "Huawei Technologies");
        let matched =
            ClassificationResult::matched("mcf", "MCF entity", RiskTier::Critical, 1.0, "huawei");
        let row = MatchRow::from_result("src", "run", &record, &matched, 6).unwrap();
        assert_eq!(row.line_number, 7);
        assert_eq!(row.text, "Huawei");
        assert_eq!(row.risk_tier, RiskTier::Critical);

        let excluded = ClassificationResult::excluded("lake", "china lake");
        assert!(MatchRow::from_result("src", "run", &record, &excluded, 6).is_none());
    }
}
