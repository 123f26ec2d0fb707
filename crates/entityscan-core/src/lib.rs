//! entityscan Core
//!
//! Core types, traits, and utilities shared across entityscan components.
//!
//! This crate provides:
//! - Record and classification types flowing through a scan
//! - Error types and result handling
//! - A streaming line source for very large plain or gzip inputs

pub mod error;
pub mod source;
pub mod types;

pub use error::{Error, Result};
pub use source::{
    estimate_total_records, Compression, DecodePolicy, Encoding, InputFormat, LineSource,
    ResumePoint, SourceOptions, SourceStats,
};
pub use types::{ClassificationResult, Record, RiskTier};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::source::{LineSource, ResumePoint, SourceOptions};
    pub use crate::types::{ClassificationResult, Record, RiskTier};
}
