//! Observability setup for the governance kernel.

#![warn(missing_docs, clippy::pedantic)]

pub mod tracing_support;

pub use tracing_support::{LogFormat, TelemetryConfig, TelemetryError, init_tracing};
