//! Entityscan Classifiers
//!
//! Prioritised pattern groups for entity detection in line-oriented text.
//!
//! A configuration is a list of named groups. Exclusion groups veto a record
//! outright; inclusion groups are tried in priority order and the first hit
//! decides the category and risk tier. Compilation happens once, up front,
//! and a compiled [`PatternClassifier`] is immutable and `Send + Sync`.

pub mod classifier;
pub mod config;
pub mod patterns;
pub mod pipeline;

pub use classifier::Classifier;
pub use config::{PatternConfig, PatternGroupSpec, PatternSpec};
pub use patterns::PatternGroup;
pub use pipeline::PatternClassifier;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::classifier::Classifier;
    pub use crate::config::PatternConfig;
    pub use crate::pipeline::PatternClassifier;
    pub use entityscan_core::{ClassificationResult, Record, RiskTier};
}
