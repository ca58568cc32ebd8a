//! Structured tracing setup.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Output style of the `fmt` subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Single-line events.
    #[default]
    Compact,
    /// Multi-line, human oriented events.
    Pretty,
}

/// Tracing configuration, usually read from the `[telemetry]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Output style.
    pub format: LogFormat,
    /// Whether to include the event target (module path).
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            format: LogFormat::Compact,
            with_target: false,
        }
    }
}

impl TelemetryConfig {
    /// Builds the filter, preferring `RUST_LOG` over the configured directive.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidFilter`] when the configured directive
    /// does not parse.
    pub fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.filter).map_err(|err| TelemetryError::InvalidFilter {
            directive: self.filter.clone(),
            reason: err.to_string(),
        })
    }
}

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configured filter directive is malformed.
    #[error("invalid tracing filter `{directive}`: {reason}")]
    InvalidFilter {
        /// Directive as configured.
        directive: String,
        /// Parser message.
        reason: String,
    },
    /// A global subscriber was already installed.
    #[error("tracing subscriber already initialised")]
    AlreadyInitialised,
}

/// Installs the global `fmt` subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidFilter`] for a malformed directive and
/// [`TelemetryError::AlreadyInitialised`] when called more than once.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    installed.map_err(|_| TelemetryError::AlreadyInitialised)?;
    tracing::debug!(filter = %config.filter, format = ?config.format, "tracing initialised");
    Ok(())
}
