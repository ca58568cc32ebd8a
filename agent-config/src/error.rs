//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating [`KernelConfig`](crate::KernelConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config `{}`: {source}", path.display())]
    Io {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for the schema.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// The file exceeds the size limit.
    #[error("config file is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Limit in bytes.
        limit: usize,
    },
    /// The file is not UTF-8.
    #[error("config file must be utf-8")]
    NotUtf8,
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
