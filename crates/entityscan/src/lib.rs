//! Entityscan
//!
//! Streams very large line-oriented OSINT files (procurement records,
//! sanctions lists, corporate registries) through prioritised pattern
//! groups and writes an exact, resumable run report.
//!
//! - [`scan`] drives one file through the classify and aggregate pipeline
//! - [`batch`] fans many files out to worker processes
//! - [`merge`] sums per-file or per-segment reports
//! - [`settings`] loads the YAML pipeline configuration

pub mod batch;
pub mod cli;
pub mod merge;
pub mod scan;
pub mod settings;
pub mod shutdown;

pub use batch::{discover_inputs, run_batch, BatchRequest, BatchSummary, WorkerStatus};
pub use merge::{merge_shards, run_merge, MergeRequest};
pub use scan::{
    ResumeMode, ScanOutcome, ScanRequest, ScanState, Scanner, EXIT_FATAL, EXIT_OK, EXIT_PARTIAL,
};
pub use settings::{PipelineConfig, ScanSettings};
pub use shutdown::{spawn_signal_listener, StopSignal};
