//! Classifier trait

use entityscan_core::{ClassificationResult, Record};

/// Trait for all record classifiers
///
/// Implementations must be pure: the same record always yields the same
/// result, and classification has no side effects.
pub trait Classifier: Send + Sync {
    /// Classify one record
    fn classify(&self, record: &Record) -> ClassificationResult;

    /// Get the classifier name
    fn name(&self) -> &str;
}

impl<C: Classifier + ?Sized> Classifier for std::sync::Arc<C> {
    fn classify(&self, record: &Record) -> ClassificationResult {
        (**self).classify(record)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
