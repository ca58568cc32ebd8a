//! Policy-gated execution pipeline for a single tool call.
//!
//! [`ToolExecutionPipeline::execute`] drives a fresh [`KernelStateMachine`]
//! through validate, policy, approval, execute, verify and compensate. The
//! contract is total: every failure, including panics raised by collaborators,
//! is encoded in the returned [`PipelineResult`].

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use agent_policy::{
    ApprovalDecision, ApprovalGate, ApprovalResult, DecisionKind, PolicyDecision,
    PolicyEvaluator, PolicyInput,
};
use agent_primitives::{ApprovalId, CallId, ProposedToolCall};
use agent_tools::{
    ActionHandler, CompensationContext, CompensationOutcome, CompensationRegistry,
    CompensationReport, CompensationStrategy, PostConditionRegistry, VerificationContext,
    VerificationReport,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::observer::PolicyObserver;
use crate::roles::verifier::{PostConditionVerifier, VerifierRole};
use crate::state_machine::{KernelState, KernelStateMachine, StateListener, TransitionResult, Trigger};

/// Terminal classification of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Executed and verified.
    Completed,
    /// Denied by policy or by an approver.
    Denied,
    /// Approval deadline passed.
    Expired,
    /// Verification failed and automated compensation succeeded.
    Compensated,
    /// Verification failed and automated compensation failed or was missing.
    CompensationFailed,
    /// Verification failed and the tool needs a human to remediate.
    RemediationRequired,
    /// Fatal error inside the pipeline.
    Failed,
    /// Never entered the pipeline.
    Rejected,
}

impl PipelineOutcome {
    /// Returns the stable snake_case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Compensated => "compensated",
            Self::CompensationFailed => "compensation_failed",
            Self::RemediationRequired => "remediation_required",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    /// Returns `true` only for [`PipelineOutcome::Completed`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy carried inside results.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum GovernanceFailure {
    /// Policy returned a hard deny.
    #[error("policy denied the call: {reason}")]
    PolicyDenied {
        /// Policy that produced the decision.
        policy_id: Option<String>,
        /// Reason reported by the policy.
        reason: String,
    },
    /// An approver denied the call.
    #[error("approval {approval_id} denied by {}", .decided_by.as_deref().unwrap_or("unknown approver"))]
    ApprovalDenied {
        /// Approval request that was denied.
        approval_id: ApprovalId,
        /// Who denied it.
        decided_by: Option<String>,
    },
    /// Nobody decided before the deadline.
    #[error("approval {approval_id} expired")]
    ApprovalExpired {
        /// Approval request that expired.
        approval_id: ApprovalId,
    },
    /// The action handler returned an error.
    #[error("execution failed: {reason}")]
    ExecutionFailed {
        /// Error reported by the handler.
        reason: String,
    },
    /// A critical postcondition did not hold.
    #[error("verification failed: {reason}")]
    VerificationFailed {
        /// Aggregated failure reason.
        reason: String,
    },
    /// Automated rollback failed or had no function registered.
    #[error("compensation failed: {detail}")]
    CompensationFailed {
        /// Detail reported by the compensation function.
        detail: String,
    },
    /// Unexpected failure inside the pipeline.
    #[error("fatal error: {detail}")]
    FatalError {
        /// Error or panic message.
        detail: String,
    },
    /// Safe mode is active; the call was not attempted.
    #[error("safe mode engaged after {consecutive_errors} consecutive errors")]
    SafeModeEngaged {
        /// Error count that tripped the breaker.
        consecutive_errors: u32,
    },
    /// No inline handler and nothing registered under the tool name.
    #[error("no handler registered for tool `{tool}`")]
    UnknownTool {
        /// Requested tool name.
        tool: String,
    },
}

impl GovernanceFailure {
    /// Returns the stable audit code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PolicyDenied { .. } => "policy_denied",
            Self::ApprovalDenied { .. } => "approval_denied",
            Self::ApprovalExpired { .. } => "approval_expired",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::VerificationFailed { .. } => "verification_failed",
            Self::CompensationFailed { .. } => "compensation_failed",
            Self::FatalError { .. } => "fatal_error",
            Self::SafeModeEngaged { .. } => "safe_mode_engaged",
            Self::UnknownTool { .. } => "unknown_tool",
        }
    }
}

/// Wall-clock and monotonic timings of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineTiming {
    /// When the pipeline started.
    pub started_at: DateTime<Utc>,
    /// Total time spent in the pipeline.
    pub total: Duration,
    /// Time parked in the approval gate.
    pub approval_wait: Option<Duration>,
    /// Time spent inside the action handler.
    pub execution: Option<Duration>,
}

/// Outcome record for one call's full lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    /// Identifier of the governed call.
    pub call_id: CallId,
    /// Tool name.
    pub tool: String,
    /// Terminal classification.
    pub outcome: PipelineOutcome,
    /// State the call's machine ended in.
    pub final_state: KernelState,
    /// Failures in the order they occurred.
    pub failures: Vec<GovernanceFailure>,
    /// Gating policy decision.
    pub policy: Option<PolicyDecision>,
    /// Approval result, when approval was required.
    pub approval: Option<ApprovalResult>,
    /// Handler output, when the handler returned one.
    pub output: Option<Value>,
    /// Verification report, when verification ran.
    pub verification: Option<VerificationReport>,
    /// Compensation report, when verification failed.
    pub compensation: Option<CompensationReport>,
    /// Every transition attempted on the call's machine.
    pub transitions: Vec<TransitionResult>,
    /// Human-readable reason chain.
    pub reasons: Vec<String>,
    /// Timings.
    pub timing: PipelineTiming,
    /// The machine's error counter when the run ended.
    pub consecutive_errors: u32,
}

impl PipelineResult {
    /// Returns `true` when the call completed and verified.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Returns the first failure, which is the one that diverted the call.
    #[must_use]
    pub fn primary_failure(&self) -> Option<&GovernanceFailure> {
        self.failures.first()
    }

    /// Returns `true` when verification ran and passed.
    #[must_use]
    pub fn verification_passed(&self) -> bool {
        self.verification.as_ref().is_some_and(VerificationReport::passed)
    }

    /// Returns `true` when the call's machine passed through `state`.
    #[must_use]
    pub fn visited(&self, state: KernelState) -> bool {
        self.transitions
            .iter()
            .any(|t| t.accepted && (t.to == state || t.from == state))
    }

    /// Joins the reason chain for display.
    #[must_use]
    pub fn reason_chain(&self) -> String {
        self.reasons.join(" -> ")
    }

    /// Builds the record for a call that never entered the pipeline.
    pub(crate) fn rejected(
        call: &ProposedToolCall,
        listeners: &[Arc<dyn StateListener>],
        failure: GovernanceFailure,
        trigger: Option<Trigger>,
    ) -> Self {
        let mut run = Run::start(call, listeners);
        if let Some(trigger) = trigger {
            run.fire(trigger);
        }
        run.fail(failure);
        run.finish(PipelineOutcome::Rejected)
    }

    /// Record for a call whose executor failed before producing a result.
    pub(crate) fn fatal(
        call: &ProposedToolCall,
        listeners: &[Arc<dyn StateListener>],
        detail: String,
    ) -> Self {
        Run::start(call, listeners).fatal(detail)
    }
}

/// Mutable scratch state of one run.
struct Run<'a> {
    call: &'a ProposedToolCall,
    machine: KernelStateMachine,
    started: Instant,
    started_at: DateTime<Utc>,
    transitions: Vec<TransitionResult>,
    reasons: Vec<String>,
    failures: Vec<GovernanceFailure>,
    policy: Option<PolicyDecision>,
    approval: Option<ApprovalResult>,
    output: Option<Value>,
    verification: Option<VerificationReport>,
    compensation: Option<CompensationReport>,
    approval_wait: Option<Duration>,
    execution: Option<Duration>,
}

impl<'a> Run<'a> {
    fn start(call: &'a ProposedToolCall, listeners: &[Arc<dyn StateListener>]) -> Self {
        let mut machine = KernelStateMachine::new();
        for listener in listeners {
            machine.add_listener(Arc::clone(listener));
        }
        Self {
            call,
            machine,
            started: Instant::now(),
            started_at: Utc::now(),
            transitions: Vec::new(),
            reasons: Vec::new(),
            failures: Vec::new(),
            policy: None,
            approval: None,
            output: None,
            verification: None,
            compensation: None,
            approval_wait: None,
            execution: None,
        }
    }

    fn fire(&mut self, trigger: Trigger) -> bool {
        let result = self.machine.transition(trigger);
        let accepted = result.accepted;
        if let Some(reason) = &result.reason {
            self.reasons.push(reason.clone());
        }
        self.transitions.push(result);
        accepted
    }

    fn fail(&mut self, failure: GovernanceFailure) {
        self.reasons.push(failure.to_string());
        self.failures.push(failure);
    }

    fn fatal(mut self, detail: String) -> PipelineResult {
        error!(
            call_id = %self.call.id(),
            tool = self.call.tool(),
            state = %self.machine.state(),
            detail = %detail,
            "fatal pipeline error"
        );
        self.fire(Trigger::FatalError);
        self.fail(GovernanceFailure::FatalError { detail });
        self.finish(PipelineOutcome::Failed)
    }

    fn rejected_transition(self, trigger: Trigger) -> PipelineResult {
        let state = self.machine.state();
        self.fatal(format!("transition `{trigger}` rejected in state `{state}`"))
    }

    fn finish(self, outcome: PipelineOutcome) -> PipelineResult {
        PipelineResult {
            call_id: self.call.id(),
            tool: self.call.tool().to_owned(),
            outcome,
            final_state: self.machine.state(),
            failures: self.failures,
            policy: self.policy,
            approval: self.approval,
            output: self.output,
            verification: self.verification,
            compensation: self.compensation,
            transitions: self.transitions,
            reasons: self.reasons,
            timing: PipelineTiming {
                started_at: self.started_at,
                total: self.started.elapsed(),
                approval_wait: self.approval_wait,
                execution: self.execution,
            },
            consecutive_errors: self.machine.consecutive_errors(),
        }
    }
}

/// Orchestrates validate, policy, approval, execute, verify and compensate.
pub struct ToolExecutionPipeline {
    policy: Arc<dyn PolicyEvaluator>,
    approvals: ApprovalGate,
    verifier: Arc<dyn VerifierRole>,
    compensation: Arc<CompensationRegistry>,
    observer: Option<Arc<dyn PolicyObserver>>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl fmt::Debug for ToolExecutionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolExecutionPipeline")
            .field("approvals", &self.approvals)
            .field("compensation", &self.compensation)
            .field("observer", &self.observer.is_some())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl ToolExecutionPipeline {
    /// Starts a builder around the supplied policy evaluator.
    #[must_use]
    pub fn builder(policy: Arc<dyn PolicyEvaluator>) -> PipelineBuilder {
        PipelineBuilder {
            policy,
            approvals: None,
            verifier: None,
            compensation: None,
            observer: None,
            listeners: Vec::new(),
        }
    }

    /// Returns the approval gate shared by every call of this pipeline.
    #[must_use]
    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    /// Returns the compensation registry.
    #[must_use]
    pub fn compensation(&self) -> &Arc<CompensationRegistry> {
        &self.compensation
    }

    /// Returns the state listeners attached to every call's machine.
    #[must_use]
    pub fn listeners(&self) -> &[Arc<dyn StateListener>] {
        &self.listeners
    }

    /// Governs and executes one call. Never fails; see [`PipelineResult`].
    pub async fn execute(
        &self,
        call: &ProposedToolCall,
        handler: &dyn ActionHandler,
    ) -> PipelineResult {
        let mut run = Run::start(call, &self.listeners);
        if !run.fire(Trigger::ToolValidated) {
            return run.rejected_transition(Trigger::ToolValidated);
        }

        let input = PolicyInput::from_call(call);
        let decision = match AssertUnwindSafe(self.policy.evaluate(&input))
            .catch_unwind()
            .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => return run.fatal(format!("policy evaluation failed: {err}")),
            Err(panic) => {
                return run.fatal(format!(
                    "policy evaluator panicked: {}",
                    panic_message(panic.as_ref())
                ));
            }
        };
        if let Some(observer) = &self.observer
            && let Err(panic) =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_decision(&input, &decision)))
        {
            error!(
                call_id = %call.id(),
                tool = call.tool(),
                panic = %panic_message(panic.as_ref()),
                "policy observer panicked"
            );
        }
        run.policy = Some(decision.clone());

        match decision.kind() {
            DecisionKind::Deny => {
                let reason = decision.reason().unwrap_or("denied by policy").to_owned();
                if !run.fire(Trigger::PolicyDenied) {
                    return run.rejected_transition(Trigger::PolicyDenied);
                }
                warn!(
                    call_id = %call.id(),
                    tool = call.tool(),
                    policy_id = decision.policy_id().unwrap_or_default(),
                    reason = %reason,
                    "call denied by policy"
                );
                run.fail(GovernanceFailure::PolicyDenied {
                    policy_id: decision.policy_id().map(str::to_owned),
                    reason,
                });
                return run.finish(PipelineOutcome::Denied);
            }
            DecisionKind::RequireApproval => {
                if !run.fire(Trigger::ApprovalRequired) {
                    return run.rejected_transition(Trigger::ApprovalRequired);
                }
                let handle = self.approvals.request_approval(call, call.risk_class());
                let parked = Instant::now();
                let result = handle.wait().await;
                run.approval_wait = Some(parked.elapsed());
                if let Some(outcome) = Self::settle_approval(&mut run, &result) {
                    run.approval = Some(result);
                    return match outcome {
                        Ok(outcome) => run.finish(outcome),
                        Err(trigger) => run.rejected_transition(trigger),
                    };
                }
                run.approval = Some(result);
            }
            DecisionKind::Allow => {
                if !run.fire(Trigger::PolicyAllowed) {
                    return run.rejected_transition(Trigger::PolicyAllowed);
                }
            }
        }

        self.run_action(run, handler).await
    }

    /// Applies an approval result. `None` means execution may proceed.
    fn settle_approval(
        run: &mut Run<'_>,
        result: &ApprovalResult,
    ) -> Option<Result<PipelineOutcome, Trigger>> {
        let call = run.call;
        match result.decision() {
            ApprovalDecision::Approved => {
                if !run.fire(Trigger::ApprovalGranted) {
                    return Some(Err(Trigger::ApprovalGranted));
                }
                info!(
                    call_id = %call.id(),
                    approval_id = %result.id(),
                    decided_by = result.decided_by().unwrap_or_default(),
                    "approval granted"
                );
                None
            }
            ApprovalDecision::Denied => {
                if !run.fire(Trigger::ApprovalDenied) {
                    return Some(Err(Trigger::ApprovalDenied));
                }
                warn!(
                    call_id = %call.id(),
                    approval_id = %result.id(),
                    decided_by = result.decided_by().unwrap_or_default(),
                    "approval denied"
                );
                run.fail(GovernanceFailure::ApprovalDenied {
                    approval_id: result.id(),
                    decided_by: result.decided_by().map(str::to_owned),
                });
                Some(Ok(PipelineOutcome::Denied))
            }
            ApprovalDecision::Expired => {
                if !run.fire(Trigger::ApprovalExpired) {
                    return Some(Err(Trigger::ApprovalExpired));
                }
                warn!(call_id = %call.id(), approval_id = %result.id(), "approval expired");
                run.fail(GovernanceFailure::ApprovalExpired {
                    approval_id: result.id(),
                });
                Some(Ok(PipelineOutcome::Expired))
            }
        }
    }

    async fn run_action(&self, mut run: Run<'_>, handler: &dyn ActionHandler) -> PipelineResult {
        let call = run.call;
        debug!(call_id = %call.id(), tool = call.tool(), "invoking action handler");

        let started = Instant::now();
        let invoked = AssertUnwindSafe(handler.invoke(call)).catch_unwind().await;
        run.execution = Some(started.elapsed());
        let ctx = match invoked {
            Ok(Ok(output)) => {
                run.output = Some(output.clone());
                VerificationContext::succeeded(call.clone(), output)
            }
            Ok(Err(err)) => {
                let reason = err.to_string();
                warn!(call_id = %call.id(), tool = call.tool(), reason = %reason, "action handler failed");
                run.fail(GovernanceFailure::ExecutionFailed {
                    reason: reason.clone(),
                });
                VerificationContext::failed(call.clone(), reason)
            }
            Err(panic) => {
                return run.fatal(format!(
                    "action handler panicked: {}",
                    panic_message(panic.as_ref())
                ));
            }
        };

        if !run.fire(Trigger::ExecutionComplete) {
            return run.rejected_transition(Trigger::ExecutionComplete);
        }

        let report = match AssertUnwindSafe(self.verifier.verify(&ctx)).catch_unwind().await {
            Ok(report) => report,
            Err(panic) => {
                return run.fatal(format!(
                    "verifier panicked: {}",
                    panic_message(panic.as_ref())
                ));
            }
        };
        run.verification = Some(report.clone());

        if report.passed() {
            if !run.fire(Trigger::VerificationPassed) {
                return run.rejected_transition(Trigger::VerificationPassed);
            }
            info!(call_id = %call.id(), tool = call.tool(), "call completed");
            return run.finish(PipelineOutcome::Completed);
        }

        let reason = report
            .failure_reason()
            .unwrap_or("verification failed")
            .to_owned();
        if !run.fire(Trigger::VerificationFailed) {
            return run.rejected_transition(Trigger::VerificationFailed);
        }
        warn!(call_id = %call.id(), tool = call.tool(), reason = %reason, "verification failed");
        run.fail(GovernanceFailure::VerificationFailed { reason });

        self.compensate(run, report).await
    }

    async fn compensate(&self, mut run: Run<'_>, verification: VerificationReport) -> PipelineResult {
        let call = run.call;
        let eligibility = self.compensation.eligibility(call.tool());
        let mut report = CompensationReport {
            strategy: eligibility.strategy(),
            rationale: eligibility.rationale().to_owned(),
            attempted: false,
            outcome: None,
        };

        if eligibility.strategy() == CompensationStrategy::Manual {
            warn!(
                call_id = %call.id(),
                tool = call.tool(),
                rationale = eligibility.rationale(),
                "flagged for manual remediation"
            );
            run.reasons
                .push(format!("manual remediation required: {}", eligibility.rationale()));
            run.compensation = Some(report);
            return run.finish(PipelineOutcome::RemediationRequired);
        }

        let Some(function) = self.compensation.function(call.tool()) else {
            let detail = format!("no compensation function registered for `{}`", call.tool());
            warn!(call_id = %call.id(), tool = call.tool(), "automated compensation missing");
            report.outcome = Some(CompensationOutcome::failed(detail.clone()));
            run.compensation = Some(report);
            run.fail(GovernanceFailure::CompensationFailed { detail });
            return run.finish(PipelineOutcome::CompensationFailed);
        };

        let ctx = CompensationContext {
            call: call.clone(),
            output: run.output.clone(),
            verification,
        };
        report.attempted = true;
        let outcome = match AssertUnwindSafe(function.compensate(&ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => CompensationOutcome::failed(format!(
                "compensation panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        let succeeded = outcome.success;
        let detail = outcome.detail.clone();
        report.outcome = Some(outcome);
        run.compensation = Some(report);
        if succeeded {
            info!(call_id = %call.id(), tool = call.tool(), detail = %detail, "compensation succeeded");
            run.reasons.push(format!("compensated: {detail}"));
            run.finish(PipelineOutcome::Compensated)
        } else {
            warn!(call_id = %call.id(), tool = call.tool(), detail = %detail, "compensation failed");
            run.fail(GovernanceFailure::CompensationFailed { detail });
            run.finish(PipelineOutcome::CompensationFailed)
        }
    }
}

/// Builder for [`ToolExecutionPipeline`].
pub struct PipelineBuilder {
    policy: Arc<dyn PolicyEvaluator>,
    approvals: Option<ApprovalGate>,
    verifier: Option<Arc<dyn VerifierRole>>,
    compensation: Option<Arc<CompensationRegistry>>,
    observer: Option<Arc<dyn PolicyObserver>>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder").finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    /// Shares an existing approval gate.
    #[must_use]
    pub fn approvals(mut self, gate: ApprovalGate) -> Self {
        self.approvals = Some(gate);
        self
    }

    /// Replaces the verifier.
    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn VerifierRole>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Verifies with the supplied postcondition registry.
    #[must_use]
    pub fn postconditions(self, registry: Arc<PostConditionRegistry>) -> Self {
        self.verifier(Arc::new(PostConditionVerifier::new(registry)))
    }

    /// Sets the compensation registry.
    #[must_use]
    pub fn compensation(mut self, registry: Arc<CompensationRegistry>) -> Self {
        self.compensation = Some(registry);
        self
    }

    /// Attaches a policy observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn PolicyObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Attaches a listener to every call's state machine.
    #[must_use]
    pub fn state_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Finalises the pipeline. Missing collaborators fall back to empty
    /// in-memory defaults.
    #[must_use]
    pub fn build(self) -> ToolExecutionPipeline {
        ToolExecutionPipeline {
            policy: self.policy,
            approvals: self.approvals.unwrap_or_default(),
            verifier: self
                .verifier
                .unwrap_or_else(|| Arc::new(PostConditionVerifier::default())),
            compensation: self.compensation.unwrap_or_default(),
            observer: self.observer,
            listeners: self.listeners,
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
