//! Pipeline configuration
//!
//! One YAML file carries the pattern groups and the run settings:
//!
//! ```yaml
//! groups: [...]            # required, see entityscan_classifiers::config
//! scan:
//!   sample_cap: 10000
//!   checkpoint_every_records: 100000
//! source:
//!   format: tsv
//!   fields: [recipient_name]
//! sink:
//!   batch_size: 500
//!   on_error: retry
//! ```
//!
//! CLI flags are layered over the file values by [`PipelineConfig::load`].

use crate::cli::SourceArgs;
use entityscan_classifiers::PatternConfig;
use entityscan_core::{Error, Result, SourceOptions};
use entityscan_telemetry::{AggregateConfig, WritePolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Everything one run needs besides its input and output paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(flatten)]
    pub patterns: PatternConfig,

    #[serde(default)]
    pub scan: ScanSettings,

    #[serde(default)]
    pub source: SourceOptions,

    #[serde(default)]
    pub sink: WritePolicy,
}

/// Streaming loop cadence and sample limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    #[serde(flatten)]
    pub samples: AggregateConfig,

    /// Log progress after this many records
    #[serde(default = "default_progress_every_records")]
    pub progress_every_records: u64,

    /// ...or after this many seconds, whichever comes first
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,

    /// Write a checkpoint after this many records
    #[serde(default = "default_checkpoint_every_records")]
    pub checkpoint_every_records: u64,

    /// Check the stop signal every this many records
    #[serde(default = "default_stop_check_every")]
    pub stop_check_every: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            samples: AggregateConfig::default(),
            progress_every_records: default_progress_every_records(),
            progress_interval_secs: default_progress_interval_secs(),
            checkpoint_every_records: default_checkpoint_every_records(),
            stop_check_every: default_stop_check_every(),
        }
    }
}

impl ScanSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

fn default_progress_every_records() -> u64 {
    1_000_000
}

fn default_progress_interval_secs() -> u64 {
    30
}

fn default_checkpoint_every_records() -> u64 {
    100_000
}

fn default_stop_check_every() -> u64 {
    1024
}

impl PipelineConfig {
    /// Built-in patterns with default settings
    pub fn builtin() -> Result<Self> {
        Ok(Self::with_patterns(PatternConfig::builtin()?))
    }

    /// Default settings around the given patterns
    pub fn with_patterns(patterns: PatternConfig) -> Self {
        Self {
            patterns,
            scan: ScanSettings::default(),
            source: SourceOptions::default(),
            sink: WritePolicy::default(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read configuration {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Load the config file (or built-in patterns) and apply CLI overrides
    pub fn load(config_path: Option<&Path>, overrides: &SourceArgs) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::builtin()?,
        };

        let source = &mut config.source;
        if let Some(encoding) = overrides.encoding {
            source.encoding = encoding;
        }
        if let Some(policy) = overrides.on_decode_error {
            source.on_decode_error = policy;
        }
        if let Some(format) = overrides.format {
            source.format = format;
        }
        if !overrides.fields.is_empty() {
            source.fields = overrides.fields.clone();
        }
        if overrides.no_header {
            source.has_header = false;
        }
        if let Some(compression) = overrides.compression {
            source.compression = compression;
        }
        if overrides.expected_records.is_some() {
            source.expected_records = overrides.expected_records;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.patterns.validate()?;
        self.sink.validate()?;

        let scan = &self.scan;
        if scan.stop_check_every == 0 {
            return Err(Error::config("scan.stop_check_every must be at least 1"));
        }
        if scan.checkpoint_every_records == 0 {
            return Err(Error::config(
                "scan.checkpoint_every_records must be at least 1",
            ));
        }
        if scan.samples.sample_text_chars == 0 {
            return Err(Error::config("scan.sample_text_chars must be at least 1"));
        }
        Ok(())
    }

    /// Identifies the pattern configuration in reports and checkpoints
    pub fn fingerprint(&self) -> Result<String> {
        self.patterns.fingerprint()
    }
}
