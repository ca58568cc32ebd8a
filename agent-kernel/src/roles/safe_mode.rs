//! Kernel-wide breaker tripped by sustained failures.
//!
//! The controller counts errors across calls. It engages when the count
//! reaches the configured threshold or on explicit escalation, and it only
//! disengages through [`SafeModeController::exit`], which requires a named
//! actor and is recorded in the history.

use std::sync::Mutex;

use agent_config::SafeModeSection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::pipeline::PipelineResult;

/// Breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeModeStatus {
    /// Calls are accepted.
    Inactive,
    /// Calls are rejected until an explicit exit.
    Active,
}

/// Kind of history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeModeEventKind {
    /// Safe mode engaged.
    Engaged,
    /// Safe mode exited.
    Exited,
}

/// Audit trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafeModeEvent {
    /// What happened.
    pub kind: SafeModeEventKind,
    /// Why it happened.
    pub reason: String,
    /// Who triggered it; `None` for automatic engagement.
    pub actor: Option<String>,
    /// Error count at the time of the event.
    pub consecutive_errors: u32,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Errors raised by safe-mode operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafeModeError {
    /// Exit was requested while inactive.
    #[error("safe mode is not active")]
    NotActive,
    /// Exit was requested without naming who authorised it.
    #[error("safe mode exit requires a named actor")]
    MissingActor,
}

#[derive(Debug)]
struct Inner {
    status: SafeModeStatus,
    consecutive_errors: u32,
    history: Vec<SafeModeEvent>,
}

/// Cross-call safe-mode breaker.
#[derive(Debug)]
pub struct SafeModeController {
    threshold: u32,
    inner: Mutex<Inner>,
}

impl Default for SafeModeController {
    fn default() -> Self {
        Self::from_section(&SafeModeSection::default())
    }
}

impl SafeModeController {
    /// Creates a controller that engages after `threshold` consecutive errors.
    /// A zero threshold is treated as one.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            inner: Mutex::new(Inner {
                status: SafeModeStatus::Inactive,
                consecutive_errors: 0,
                history: Vec::new(),
            }),
        }
    }

    /// Creates a controller from the configuration section.
    #[must_use]
    pub fn from_section(section: &SafeModeSection) -> Self {
        Self::new(section.error_threshold)
    }

    /// Returns the engagement threshold.
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Returns the current status.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn status(&self) -> SafeModeStatus {
        self.lock().status
    }

    /// Returns `true` while calls are being rejected.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status() == SafeModeStatus::Active
    }

    /// Returns the cross-call error count.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.lock().consecutive_errors
    }

    /// Returns every engage and exit event, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn history(&self) -> Vec<SafeModeEvent> {
        self.lock().history.clone()
    }

    /// Folds a call result into the error count and engages when the
    /// threshold is reached. Completed calls reset the count; denials and
    /// expiries leave it unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn record(&self, result: &PipelineResult) -> SafeModeStatus {
        let mut inner = self.lock();
        if result.consecutive_errors > 0 {
            inner.consecutive_errors = inner
                .consecutive_errors
                .saturating_add(result.consecutive_errors);
        } else if result.is_success() {
            inner.consecutive_errors = 0;
        }

        if inner.status == SafeModeStatus::Inactive && inner.consecutive_errors >= self.threshold {
            let reason = format!(
                "{} consecutive errors reached threshold {}",
                inner.consecutive_errors, self.threshold
            );
            Self::engage(&mut inner, reason, None);
        }
        inner.status
    }

    /// Engages safe mode explicitly. Returns `false` when already active.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn escalate(&self, reason: impl Into<String>) -> bool {
        let mut inner = self.lock();
        if inner.status == SafeModeStatus::Active {
            return false;
        }
        Self::engage(&mut inner, reason.into(), None);
        true
    }

    /// Leaves safe mode and zeroes the error count.
    ///
    /// # Errors
    ///
    /// Returns [`SafeModeError::MissingActor`] for a blank actor and
    /// [`SafeModeError::NotActive`] when safe mode is not engaged.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn exit(
        &self,
        actor: &str,
        reason: impl Into<String>,
    ) -> Result<SafeModeEvent, SafeModeError> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(SafeModeError::MissingActor);
        }
        let mut inner = self.lock();
        if inner.status != SafeModeStatus::Active {
            return Err(SafeModeError::NotActive);
        }

        let event = SafeModeEvent {
            kind: SafeModeEventKind::Exited,
            reason: reason.into(),
            actor: Some(actor.to_owned()),
            consecutive_errors: inner.consecutive_errors,
            at: Utc::now(),
        };
        info!(actor, reason = %event.reason, "safe mode exited");
        inner.status = SafeModeStatus::Inactive;
        inner.consecutive_errors = 0;
        inner.history.push(event.clone());
        Ok(event)
    }

    fn engage(inner: &mut Inner, reason: String, actor: Option<String>) {
        warn!(
            consecutive_errors = inner.consecutive_errors,
            reason = %reason,
            "safe mode engaged"
        );
        inner.status = SafeModeStatus::Active;
        inner.history.push(SafeModeEvent {
            kind: SafeModeEventKind::Engaged,
            reason,
            actor,
            consecutive_errors: inner.consecutive_errors,
            at: Utc::now(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("safe mode state poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use agent_primitives::ProposedToolCall;

    use crate::pipeline::{PipelineOutcome, PipelineTiming};
    use crate::state_machine::KernelState;

    fn result(outcome: PipelineOutcome, consecutive_errors: u32) -> PipelineResult {
        let call = ProposedToolCall::builder("fs.write").build().unwrap();
        PipelineResult {
            call_id: call.id(),
            tool: "fs.write".into(),
            outcome,
            final_state: if consecutive_errors > 0 {
                KernelState::Error
            } else {
                KernelState::Idle
            },
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
            consecutive_errors,
        }
    }

    #[test]
    fn engages_at_threshold() {
        let controller = SafeModeController::new(2);
        assert_eq!(
            controller.record(&result(PipelineOutcome::Failed, 1)),
            SafeModeStatus::Inactive
        );
        assert_eq!(
            controller.record(&result(PipelineOutcome::RemediationRequired, 1)),
            SafeModeStatus::Active
        );

        let history = controller.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, SafeModeEventKind::Engaged);
        assert_eq!(history[0].consecutive_errors, 2);
        assert!(history[0].actor.is_none());
    }

    #[test]
    fn success_resets_and_denials_do_not() {
        let controller = SafeModeController::new(3);
        controller.record(&result(PipelineOutcome::Failed, 1));
        controller.record(&result(PipelineOutcome::Denied, 0));
        assert_eq!(controller.consecutive_errors(), 1);
        controller.record(&result(PipelineOutcome::Completed, 0));
        assert_eq!(controller.consecutive_errors(), 0);
    }

    #[test]
    fn exit_requires_actor_and_active_state() {
        let controller = SafeModeController::default();
        assert_eq!(controller.exit("ops", "drill"), Err(SafeModeError::NotActive));

        assert!(controller.escalate("operator request"));
        assert!(!controller.escalate("again"));
        assert_eq!(controller.exit("  ", "fixed"), Err(SafeModeError::MissingActor));
        assert!(controller.is_active());

        let event = controller.exit("alice", "root cause fixed").unwrap();
        assert_eq!(event.actor.as_deref(), Some("alice"));
        assert_eq!(controller.status(), SafeModeStatus::Inactive);
        assert_eq!(controller.consecutive_errors(), 0);

        let kinds: Vec<_> = controller.history().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [SafeModeEventKind::Engaged, SafeModeEventKind::Exited]);
    }

    #[test]
    fn never_exits_automatically() {
        let controller = SafeModeController::new(1);
        controller.record(&result(PipelineOutcome::Failed, 1));
        controller.record(&result(PipelineOutcome::Completed, 0));
        assert!(controller.is_active());
    }
}
