//! Entityscan Telemetry
//!
//! Everything a scan produces besides classifications:
//! - Exact aggregation with a bounded sample buffer
//! - The JSON run report, written atomically
//! - Resume checkpoints
//! - The batched structured match store
//! - Progress logging and metrics

pub mod aggregate;
pub mod checkpoint;
pub mod metrics;
pub mod persistence;
pub mod progress;
pub mod report;
pub mod store;

pub use aggregate::{AggregateConfig, AggregateStats, Counts};
pub use checkpoint::{checkpoint_path, Checkpoint};
pub use metrics::MetricsCollector;
pub use persistence::{read_report, write_json_atomic};
pub use progress::ProgressTracker;
pub use report::{RunMeta, RunReport, RunStatus, SampleRecord};
pub use store::{BatchWriter, MatchRow, MatchStore, OnWriteError, SqliteStore, WritePolicy};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::aggregate::{AggregateConfig, AggregateStats};
    pub use crate::report::{RunMeta, RunReport, RunStatus};
    pub use crate::store::{BatchWriter, MatchStore, SqliteStore};
}
