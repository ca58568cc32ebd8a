//! Drift auditing over a rolling window of pipeline results.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

use agent_config::AuditSection;
use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::pipeline::{PipelineOutcome, PipelineResult};

/// Kind of drift detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Too many calls failed after execution.
    FailureRate,
    /// Too many calls were denied.
    DenialRate,
    /// A tool outside the expected set was called.
    UnexpectedTool,
    /// The auditor itself failed; no ratios were computed.
    AuditorFailure,
}

/// One drift signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftFinding {
    /// Signal kind.
    pub kind: DriftKind,
    /// Human-readable explanation.
    pub detail: String,
}

/// Result of auditing one trace against the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    /// Samples currently in the window.
    pub samples: usize,
    /// Share of windowed calls that failed after execution.
    pub failure_ratio: f64,
    /// Share of windowed calls that were denied.
    pub denial_ratio: f64,
    /// Findings raised by this trace.
    pub findings: Vec<DriftFinding>,
}

impl AuditReport {
    /// Returns `true` when any finding was raised.
    #[must_use]
    pub fn is_drifting(&self) -> bool {
        !self.findings.is_empty()
    }

    /// Report standing in for an audit that could not run.
    pub(crate) fn auditor_failed(detail: impl Into<String>) -> Self {
        Self {
            samples: 0,
            failure_ratio: 0.0,
            denial_ratio: 0.0,
            findings: vec![DriftFinding {
                kind: DriftKind::AuditorFailure,
                detail: detail.into(),
            }],
        }
    }

    /// Returns `true` when the failure rate breached its threshold.
    #[must_use]
    pub fn requires_safe_mode(&self) -> bool {
        self.findings.iter().any(|f| f.kind == DriftKind::FailureRate)
    }
}

/// Observes traces for behavioural drift.
#[async_trait]
pub trait AuditorRole: Send + Sync {
    /// Adds the trace to the auditor's view and reports drift.
    async fn audit(&self, trace: &PipelineResult) -> AuditReport;
}

/// Thresholds for [`DriftAuditor`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuditConfig {
    /// Traces kept in the window.
    pub window: usize,
    /// Ratios are only judged once this many samples exist.
    pub min_samples: usize,
    /// Failure ratio above which drift is flagged.
    pub max_failure_ratio: f64,
    /// Denial ratio above which drift is flagged.
    pub max_denial_ratio: f64,
    /// Tools the agent is expected to call; empty disables the check.
    pub expected_tools: BTreeSet<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self::from_section(&AuditSection::default())
    }
}

impl AuditConfig {
    /// Converts the configuration file section.
    #[must_use]
    pub fn from_section(section: &AuditSection) -> Self {
        Self {
            window: section.window,
            min_samples: section.min_samples,
            max_failure_ratio: section.max_failure_ratio,
            max_denial_ratio: section.max_denial_ratio,
            expected_tools: section.expected_tools.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    failed: bool,
    denied: bool,
}

/// Rolling-window drift auditor.
#[derive(Debug)]
pub struct DriftAuditor {
    config: AuditConfig,
    window: Mutex<VecDeque<Sample>>,
}

impl Default for DriftAuditor {
    fn default() -> Self {
        Self::new(AuditConfig::default())
    }
}

impl DriftAuditor {
    /// Creates an auditor with the supplied thresholds.
    #[must_use]
    pub fn new(config: AuditConfig) -> Self {
        let capacity = config.window.max(1);
        Self {
            config,
            window: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Returns the thresholds.
    #[must_use]
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Drops every windowed sample.
    ///
    /// # Panics
    ///
    /// Panics if the window lock is poisoned.
    pub fn clear(&self) {
        self.window.lock().expect("audit window poisoned").clear();
    }

    fn sample(trace: &PipelineResult) -> Sample {
        Sample {
            failed: matches!(
                trace.outcome,
                PipelineOutcome::Failed
                    | PipelineOutcome::Compensated
                    | PipelineOutcome::CompensationFailed
                    | PipelineOutcome::RemediationRequired
            ),
            denied: trace.outcome == PipelineOutcome::Denied,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

#[async_trait]
impl AuditorRole for DriftAuditor {
    /// # Panics
    ///
    /// Panics if the window lock is poisoned.
    async fn audit(&self, trace: &PipelineResult) -> AuditReport {
        let (samples, failures, denials) = {
            let mut window = self.window.lock().expect("audit window poisoned");
            window.push_back(Self::sample(trace));
            while window.len() > self.config.window.max(1) {
                window.pop_front();
            }
            (
                window.len(),
                window.iter().filter(|s| s.failed).count(),
                window.iter().filter(|s| s.denied).count(),
            )
        };

        let failure_ratio = ratio(failures, samples);
        let denial_ratio = ratio(denials, samples);
        let mut findings = Vec::new();

        if samples >= self.config.min_samples {
            if failure_ratio > self.config.max_failure_ratio {
                findings.push(DriftFinding {
                    kind: DriftKind::FailureRate,
                    detail: format!(
                        "failure ratio {failure_ratio:.2} over {samples} calls exceeds {:.2}",
                        self.config.max_failure_ratio
                    ),
                });
            }
            if denial_ratio > self.config.max_denial_ratio {
                findings.push(DriftFinding {
                    kind: DriftKind::DenialRate,
                    detail: format!(
                        "denial ratio {denial_ratio:.2} over {samples} calls exceeds {:.2}",
                        self.config.max_denial_ratio
                    ),
                });
            }
        }
        if !self.config.expected_tools.is_empty()
            && !self.config.expected_tools.contains(&trace.tool)
        {
            findings.push(DriftFinding {
                kind: DriftKind::UnexpectedTool,
                detail: format!("tool `{}` is outside the expected set", trace.tool),
            });
        }

        for finding in &findings {
            warn!(
                call_id = %trace.call_id,
                tool = %trace.tool,
                kind = ?finding.kind,
                detail = %finding.detail,
                "drift detected"
            );
        }

        AuditReport {
            samples,
            failure_ratio,
            denial_ratio,
            findings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use agent_primitives::ProposedToolCall;
    use chrono::Utc;

    use crate::pipeline::PipelineTiming;
    use crate::state_machine::KernelState;

    fn trace(tool: &str, outcome: PipelineOutcome) -> PipelineResult {
        let call = ProposedToolCall::builder(tool).build().unwrap();
        PipelineResult {
            call_id: call.id(),
            tool: tool.to_owned(),
            outcome,
            final_state: KernelState::Idle,
            failures: Vec::new(),
            policy: None,
            approval: None,
            output: None,
            verification: None,
            compensation: None,
            transitions: Vec::new(),
            reasons: Vec::new(),
            timing: PipelineTiming {
                started_at: Utc::now(),
                total: Duration::ZERO,
                approval_wait: None,
                execution: None,
            },
            consecutive_errors: 0,
        }
    }

    fn auditor(window: usize, min_samples: usize) -> DriftAuditor {
        DriftAuditor::new(AuditConfig {
            window,
            min_samples,
            max_failure_ratio: 0.5,
            max_denial_ratio: 0.5,
            expected_tools: BTreeSet::new(),
        })
    }

    #[tokio::test]
    async fn waits_for_min_samples() {
        let auditor = auditor(10, 3);
        let report = auditor.audit(&trace("fs.write", PipelineOutcome::Failed)).await;
        assert_eq!(report.samples, 1);
        assert!((report.failure_ratio - 1.0).abs() < f64::EPSILON);
        assert!(!report.is_drifting());
    }

    #[tokio::test]
    async fn flags_failure_drift_for_safe_mode() {
        let auditor = auditor(10, 3);
        auditor.audit(&trace("fs.write", PipelineOutcome::Completed)).await;
        auditor.audit(&trace("fs.write", PipelineOutcome::RemediationRequired)).await;
        let report = auditor.audit(&trace("fs.write", PipelineOutcome::Failed)).await;

        assert!(report.requires_safe_mode());
        assert_eq!(report.findings[0].kind, DriftKind::FailureRate);
    }

    #[tokio::test]
    async fn denials_are_flagged_without_safe_mode() {
        let auditor = auditor(10, 2);
        auditor.audit(&trace("fs.delete", PipelineOutcome::Denied)).await;
        let report = auditor.audit(&trace("fs.delete", PipelineOutcome::Denied)).await;

        assert!(report.is_drifting());
        assert!(!report.requires_safe_mode());
        assert_eq!(report.findings[0].kind, DriftKind::DenialRate);
    }

    #[tokio::test]
    async fn window_evicts_oldest_samples() {
        let auditor = auditor(2, 1);
        auditor.audit(&trace("fs.write", PipelineOutcome::Failed)).await;
        auditor.audit(&trace("fs.write", PipelineOutcome::Completed)).await;
        let report = auditor.audit(&trace("fs.write", PipelineOutcome::Completed)).await;

        assert_eq!(report.samples, 2);
        assert!(report.failure_ratio.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unexpected_tools_are_reported() {
        let auditor = DriftAuditor::new(AuditConfig {
            expected_tools: BTreeSet::from(["fs.read".to_owned()]),
            ..AuditConfig::default()
        });
        let report = auditor.audit(&trace("shell.exec", PipelineOutcome::Completed)).await;

        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, DriftKind::UnexpectedTool);
    }
}
