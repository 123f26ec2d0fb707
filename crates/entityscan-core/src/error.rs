//! Error types for entityscan

use std::path::PathBuf;

/// Result type alias using entityscan's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for entityscan operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration (missing field, bad value). Fatal before streaming.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pattern failed to compile. Fatal before streaming.
    #[error("invalid pattern `{pattern}` in group `{group}`: {message}")]
    Pattern {
        group: String,
        pattern: String,
        message: String,
    },

    /// The input could not be opened or became unreadable mid-stream
    #[error("source error on {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single line could not be decoded under the declared encoding
    #[error("decode error at line {line}: {message}")]
    Decode { line: u64, message: String },

    /// A batch insert into the structured store failed
    #[error("sink write error (batch {batch}): {message}")]
    SinkWrite { batch: u64, message: String },

    /// The structured store could not be opened or prepared
    #[error("match store error: {0}")]
    Store(String),

    /// The run was stopped by an external signal
    #[error("run interrupted after line {line}")]
    Interrupted { line: u64 },

    /// Checkpoint file problems (unreadable, config mismatch)
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Filesystem errors outside the input stream
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new pattern compilation error
    pub fn pattern(
        group: impl Into<String>,
        pattern: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Pattern {
            group: group.into(),
            pattern: pattern.into(),
            message: message.to_string(),
        }
    }

    /// Create a new source error for the given path
    pub fn source_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Source {
            path: path.into(),
            source,
        }
    }

    /// Create a new sink write error
    pub fn sink_write(batch: u64, message: impl Into<String>) -> Self {
        Self::SinkWrite {
            batch,
            message: message.into(),
        }
    }

    /// Create a new store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is raised before any record is streamed
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Pattern { .. })
    }

    /// Whether the run can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::SinkWrite { .. })
    }
}
