//! Shared error definitions for agent primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the governance runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided identifier could not be parsed.
    #[error("invalid identifier: {source}")]
    InvalidId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// Tool name failed validation.
    #[error("invalid tool name `{name}`: {reason}")]
    InvalidToolName {
        /// The offending tool name.
        name: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Risk class label did not match a known tier.
    #[error("unknown risk class `{0}`")]
    UnknownRiskClass(String),
}
