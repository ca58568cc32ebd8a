//! Error types for the trace store.

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors emitted by memory components.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The provided configuration was invalid.
    #[error("invalid memory configuration: {0}")]
    InvalidConfig(&'static str),
    /// Underlying I/O failure while reading or writing journal files.
    #[error("i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },
    /// Serialization or deserialization error.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: SerdeError,
    },
    /// A journal line other than the last one could not be decoded.
    #[error("corrupt journal entry at line {line}")]
    CorruptJournal {
        /// One-based line number of the offending entry.
        line: usize,
    },
    /// Operation that requires a configured journal was invoked without one.
    #[error("memory journal not configured")]
    MissingJournal,
    /// Memory record failed validation.
    #[error("invalid memory record: {0}")]
    InvalidRecord(&'static str),
}

/// Result type alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
