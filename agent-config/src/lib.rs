//! Kernel configuration.
//!
//! [`KernelConfig`] is read from TOML, validated, and converted into the
//! runtime types of the policy, memory, and telemetry crates.

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_ENV_VAR, ConfigSource, DEFAULT_CONFIG_NAME, MAX_CONFIG_FILE_SIZE};
pub use schema::{
    ApprovalSection, AuditSection, KernelConfig, MemorySection, SafeModeSection, SchedulerSection,
};
