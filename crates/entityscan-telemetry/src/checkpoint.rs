//! Resume checkpoints
//!
//! A checkpoint sits next to the report as `<report>.checkpoint.json`. It
//! records where the run got to and the counts accumulated up to there, so
//! `--resume` continues the same totals.

use crate::aggregate::Counts;
use crate::persistence::{read_json, remove_if_exists, write_json_atomic};
use chrono::{DateTime, Utc};
use entityscan_core::{Error, Result, ResumePoint};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CHECKPOINT_VERSION: u32 = 1;

/// Progress marker for one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub input: PathBuf,
    pub config_fingerprint: String,
    /// Last physical line fully processed
    pub line: u64,
    /// Byte offset just past `line` in the (decompressed) stream
    pub byte_offset: u64,
    pub counts: Counts,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        input: impl Into<PathBuf>,
        config_fingerprint: impl Into<String>,
        line: u64,
        byte_offset: u64,
        counts: Counts,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            input: input.into(),
            config_fingerprint: config_fingerprint.into(),
            line,
            byte_offset,
            counts,
            updated_at: Utc::now(),
        }
    }

    /// Load a checkpoint if one exists
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint: Self = read_json(path).map_err(|e| {
            Error::checkpoint(format!("unreadable checkpoint {}: {}", path.display(), e))
        })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::checkpoint(format!(
                "checkpoint {} has version {}, expected {}",
                path.display(),
                checkpoint.version,
                CHECKPOINT_VERSION
            )));
        }
        debug!("Loaded checkpoint at line {}", checkpoint.line);
        Ok(Some(checkpoint))
    }

    /// Atomically write the checkpoint
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Refuse to resume a different input or pattern configuration
    pub fn verify(&self, input: &Path, config_fingerprint: &str) -> Result<()> {
        if self.input != input {
            return Err(Error::checkpoint(format!(
                "checkpoint belongs to {}, not {}",
                self.input.display(),
                input.display()
            )));
        }
        if self.config_fingerprint != config_fingerprint {
            return Err(Error::checkpoint(
                "pattern configuration changed since the checkpoint was written",
            ));
        }
        Ok(())
    }

    /// Where the source should restart
    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            line: self.line,
            byte_offset: Some(self.byte_offset),
        }
    }
}

/// Checkpoint path for a report path
pub fn checkpoint_path(report: &Path) -> PathBuf {
    let mut name = report
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "report.json".into());
    name.push(".checkpoint.json");
    report.with_file_name(name)
}

/// Delete the checkpoint after a clean finish
pub fn clear(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    remove_if_exists(path)?;
    info!("Removed checkpoint {}", path.display());
    Ok(())
}
