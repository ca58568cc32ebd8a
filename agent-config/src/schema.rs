//! Strongly typed configuration schema.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use agent_memory::VolatileConfig;
use agent_policy::ApprovalTtlPolicy;
use agent_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for a governance kernel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Approval TTLs per risk class.
    pub approval: ApprovalSection,
    /// Safe-mode breaker.
    pub safe_mode: SafeModeSection,
    /// Drift auditor.
    pub audit: AuditSection,
    /// Task scheduler.
    pub scheduler: SchedulerSection,
    /// Trace store.
    pub memory: MemorySection,
    /// Tracing subscriber.
    pub telemetry: TelemetryConfig,
}

impl KernelConfig {
    /// Checks every section for out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> ConfigResult<()> {
        self.approval.validate()?;
        if self.safe_mode.error_threshold == 0 {
            return Err(invalid("safe_mode.error_threshold must be greater than zero"));
        }
        self.audit.validate()?;
        if self.scheduler.max_concurrency == 0 {
            return Err(invalid("scheduler.max_concurrency must be greater than zero"));
        }
        if self.memory.volatile_capacity == 0 {
            return Err(invalid("memory.volatile_capacity must be greater than zero"));
        }
        if self
            .memory
            .journal_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(invalid("memory.journal_path must not be empty"));
        }
        if self.telemetry.filter.trim().is_empty() {
            return Err(invalid("telemetry.filter must not be empty"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_owned())
}

/// `[approval]` section. Values are milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApprovalSection {
    /// TTL for low-risk calls.
    pub low_ttl_ms: u64,
    /// TTL for medium-risk calls.
    pub medium_ttl_ms: u64,
    /// TTL for high-risk calls.
    pub high_ttl_ms: u64,
    /// TTL for critical calls.
    pub critical_ttl_ms: u64,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            low_ttl_ms: 300_000,
            medium_ttl_ms: 120_000,
            high_ttl_ms: 60_000,
            critical_ttl_ms: 30_000,
        }
    }
}

impl ApprovalSection {
    fn validate(&self) -> ConfigResult<()> {
        for (key, value) in [
            ("low_ttl_ms", self.low_ttl_ms),
            ("medium_ttl_ms", self.medium_ttl_ms),
            ("high_ttl_ms", self.high_ttl_ms),
            ("critical_ttl_ms", self.critical_ttl_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "approval.{key} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Converts the section into the gate's TTL policy.
    #[must_use]
    pub fn ttl_policy(&self) -> ApprovalTtlPolicy {
        ApprovalTtlPolicy::new(
            Duration::from_millis(self.low_ttl_ms),
            Duration::from_millis(self.medium_ttl_ms),
            Duration::from_millis(self.high_ttl_ms),
            Duration::from_millis(self.critical_ttl_ms),
        )
    }
}

/// `[safe_mode]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafeModeSection {
    /// Consecutive errors that trip the breaker.
    pub error_threshold: u32,
}

impl Default for SafeModeSection {
    fn default() -> Self {
        Self { error_threshold: 3 }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSection {
    /// Number of traces kept in the drift window.
    pub window: usize,
    /// Traces required before ratios are judged.
    pub min_samples: usize,
    /// Drift is flagged when the failure ratio exceeds this.
    pub max_failure_ratio: f64,
    /// Drift is flagged when the denial ratio exceeds this.
    pub max_denial_ratio: f64,
    /// Tools the agent is expected to call. Empty disables the check.
    pub expected_tools: Vec<String>,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            window: 50,
            min_samples: 5,
            max_failure_ratio: 0.5,
            max_denial_ratio: 0.5,
            expected_tools: Vec::new(),
        }
    }
}

impl AuditSection {
    fn validate(&self) -> ConfigResult<()> {
        if self.window == 0 {
            return Err(invalid("audit.window must be greater than zero"));
        }
        if self.min_samples > self.window {
            return Err(invalid("audit.min_samples must not exceed audit.window"));
        }
        for (key, ratio) in [
            ("max_failure_ratio", self.max_failure_ratio),
            ("max_denial_ratio", self.max_denial_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "audit.{key} must be within (0, 1], got {ratio}"
                )));
            }
        }
        if self.expected_tools.iter().any(|tool| tool.trim().is_empty()) {
            return Err(invalid("audit.expected_tools must not contain empty names"));
        }
        Ok(())
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    /// Maximum concurrently running requests.
    pub max_concurrency: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { max_concurrency: 32 }
    }
}

/// `[memory]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySection {
    /// Traces retained in the volatile ring.
    pub volatile_capacity: usize,
    /// Optional NDJSON journal location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            volatile_capacity: 256,
            journal_path: None,
        }
    }
}

impl MemorySection {
    /// Converts the capacity into the ring configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the capacity is zero.
    pub fn volatile_config(&self) -> ConfigResult<VolatileConfig> {
        NonZeroUsize::new(self.volatile_capacity)
            .map(VolatileConfig::new)
            .ok_or_else(|| invalid("memory.volatile_capacity must be greater than zero"))
    }
}
