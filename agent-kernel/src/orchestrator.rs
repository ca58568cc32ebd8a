//! The kernel's single external entry point.
//!
//! [`KernelOrchestrator`] plans a request, runs every step through the
//! executor, and feeds each result to the auditor, the safe-mode breaker, and
//! the memory writer. Like the pipeline it is total: planning errors, unknown
//! tools and safe-mode rejections are reported in the [`OrchestratedResult`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use agent_config::KernelConfig;
use agent_memory::MemoryBus;
use agent_policy::{ApprovalGate, ApprovalTtlPolicy, PolicyEvaluator};
use agent_primitives::ProposedToolCall;
use agent_tools::{ActionHandler, CompensationRegistry, PostConditionRegistry, ToolRegistry};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::KernelResult;
use crate::observer::PolicyObserver;
use crate::pipeline::{GovernanceFailure, PipelineResult, ToolExecutionPipeline, panic_message};
use crate::roles::{
    AuditConfig, AuditReport, AuditorRole, DirectPlanner, DriftAuditor, ExecutionPlan,
    ExecutorRole, GatedMemoryWriter, KernelRequest, MemoryWriteReport, MemoryWriteRequest,
    MemoryWriterRole, PlannerRole, SafeModeController, SafeModeError, SafeModeEvent,
    SafeModeStatus, VerifierRole,
};
use crate::scheduler::{SchedulerConfig, SchedulerResult, TaskScheduler};
use crate::state_machine::{StateListener, Trigger};

/// Everything the orchestrator learned about one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Pipeline result, or the rejection record.
    pub result: PipelineResult,
    /// Drift audit, when the call went through the pipeline.
    pub audit: Option<AuditReport>,
    /// Memory write, when the call went through the pipeline.
    pub memory: Option<MemoryWriteReport>,
}

impl StepReport {
    fn rejected(result: PipelineResult) -> Self {
        Self {
            result,
            audit: None,
            memory: None,
        }
    }
}

/// Outcome of one orchestrated request.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratedResult {
    /// Request identifier.
    pub request_id: Uuid,
    /// Steps that ran, in order. Earlier successful steps are never rolled back.
    pub steps: Vec<StepReport>,
    /// Index of the step that stopped the plan.
    pub halted_at: Option<usize>,
    /// Why no plan was produced.
    pub planning_error: Option<String>,
    /// Breaker status after the request.
    pub safe_mode: SafeModeStatus,
}

impl OrchestratedResult {
    /// Returns `true` when a plan ran to completion with every step verified.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.planning_error.is_none()
            && self.halted_at.is_none()
            && self.steps.iter().all(|s| s.result.is_success())
    }

    /// Iterates over the pipeline results.
    pub fn results(&self) -> impl Iterator<Item = &PipelineResult> {
        self.steps.iter().map(|s| &s.result)
    }

    /// Returns the last step's result.
    #[must_use]
    pub fn last(&self) -> Option<&PipelineResult> {
        self.steps.last().map(|s| &s.result)
    }
}

/// Composes the role layer around the execution pipeline.
pub struct KernelOrchestrator {
    planner: Arc<dyn PlannerRole>,
    executor: Arc<dyn ExecutorRole>,
    auditor: Arc<dyn AuditorRole>,
    memory_writer: Arc<dyn MemoryWriterRole>,
    memory: Option<MemoryBus>,
    safe_mode: Arc<SafeModeController>,
    tools: Arc<ToolRegistry>,
    approvals: ApprovalGate,
    scheduler: TaskScheduler,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl fmt::Debug for KernelOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelOrchestrator")
            .field("approvals", &self.approvals)
            .field("safe_mode", &self.safe_mode)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl KernelOrchestrator {
    /// Starts a builder around the supplied policy evaluator.
    #[must_use]
    pub fn builder(policy: Arc<dyn PolicyEvaluator>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(policy)
    }

    /// Plans and governs a request.
    pub async fn handle(&self, request: KernelRequest) -> OrchestratedResult {
        let request_id = request.id();
        let planned = AssertUnwindSafe(self.planner.plan(&request))
            .catch_unwind()
            .await;
        let error = match planned {
            Ok(Ok(plan)) => return self.handle_plan(plan).await,
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("planner panicked: {}", panic_message(panic.as_ref())),
        };
        warn!(%request_id, error = %error, "request could not be planned");
        OrchestratedResult {
            request_id,
            steps: Vec::new(),
            halted_at: None,
            planning_error: Some(error),
            safe_mode: self.safe_mode.status(),
        }
    }

    /// Runs plan steps in order, stopping at the first step that did not
    /// complete.
    pub async fn handle_plan(&self, plan: ExecutionPlan) -> OrchestratedResult {
        let mut steps = Vec::with_capacity(plan.steps.len());
        let mut halted_at = None;
        for step in &plan.steps {
            let report = self
                .run_step(&step.call, step.handler.as_deref(), Some(plan.request_id))
                .await;
            let completed = report.result.is_success();
            steps.push(report);
            if !completed {
                halted_at = Some(step.index);
                break;
            }
        }

        info!(
            request_id = %plan.request_id,
            planned = plan.steps.len(),
            ran = steps.len(),
            halted_at = ?halted_at,
            "request handled"
        );
        OrchestratedResult {
            request_id: plan.request_id,
            steps,
            halted_at,
            planning_error: None,
            safe_mode: self.safe_mode.status(),
        }
    }

    /// Governs a single call with an explicit handler.
    pub async fn handle_call(
        &self,
        call: &ProposedToolCall,
        handler: &dyn ActionHandler,
    ) -> StepReport {
        self.run_step(call, Some(handler), None).await
    }

    /// Schedules a request on the bounded scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Scheduler`](crate::KernelError::Scheduler) when
    /// the scheduler is closed.
    pub fn spawn(
        self: &Arc<Self>,
        request: KernelRequest,
    ) -> KernelResult<JoinHandle<SchedulerResult<OrchestratedResult>>> {
        let this = Arc::clone(self);
        Ok(self.scheduler.spawn(async move { this.handle(request).await })?)
    }

    /// Leaves safe mode on behalf of `actor`.
    ///
    /// # Errors
    ///
    /// See [`SafeModeController::exit`].
    pub fn exit_safe_mode(
        &self,
        actor: &str,
        reason: impl Into<String>,
    ) -> Result<SafeModeEvent, SafeModeError> {
        self.safe_mode.exit(actor, reason)
    }

    /// Stops accepting scheduled work and expires every pending approval.
    /// Returns the number of approvals that were expired.
    pub fn shutdown(&self) -> usize {
        self.scheduler.close();
        let expired = self.approvals.dispose();
        info!(expired, "kernel shut down");
        expired
    }

    /// Returns the shared approval gate for approval surfaces.
    #[must_use]
    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    /// Returns the trace store, when the default memory writer is in use.
    #[must_use]
    pub fn memory(&self) -> Option<&MemoryBus> {
        self.memory.as_ref()
    }

    /// Returns the safe-mode breaker.
    #[must_use]
    pub fn safe_mode(&self) -> &Arc<SafeModeController> {
        &self.safe_mode
    }

    /// Returns the tool registry.
    #[must_use]
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    async fn run_step(
        &self,
        call: &ProposedToolCall,
        inline: Option<&dyn ActionHandler>,
        request_id: Option<Uuid>,
    ) -> StepReport {
        if self.safe_mode.is_active() {
            let consecutive_errors = self.safe_mode.consecutive_errors();
            warn!(
                call_id = %call.id(),
                tool = call.tool(),
                consecutive_errors,
                "call rejected, safe mode engaged"
            );
            return StepReport::rejected(PipelineResult::rejected(
                call,
                &self.listeners,
                GovernanceFailure::SafeModeEngaged { consecutive_errors },
                Some(Trigger::EscalateSafeMode),
            ));
        }

        let registered;
        let handler: &dyn ActionHandler = if let Some(handler) = inline {
            handler
        } else if let Some(handle) = self.tools.get(call.tool()) {
            registered = handle;
            &registered
        } else {
            warn!(call_id = %call.id(), tool = call.tool(), "call rejected, unknown tool");
            return StepReport::rejected(PipelineResult::rejected(
                call,
                &self.listeners,
                GovernanceFailure::UnknownTool {
                    tool: call.tool().to_owned(),
                },
                None,
            ));
        };

        let result = match AssertUnwindSafe(self.executor.execute(call, handler))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => PipelineResult::fatal(
                call,
                &self.listeners,
                format!("executor panicked: {}", panic_message(panic.as_ref())),
            ),
        };

        let audit = match AssertUnwindSafe(self.auditor.audit(&result)).catch_unwind().await {
            Ok(audit) => audit,
            Err(panic) => {
                let detail = format!("auditor panicked: {}", panic_message(panic.as_ref()));
                error!(call_id = %call.id(), tool = call.tool(), detail = %detail, "audit failed");
                AuditReport::auditor_failed(detail)
            }
        };
        self.safe_mode.record(&result);
        if audit.requires_safe_mode() {
            let detail = audit
                .findings
                .iter()
                .map(|f| f.detail.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            self.safe_mode.escalate(format!("drift detected: {detail}"));
        }

        let mut write = MemoryWriteRequest::new(&result);
        if let Some(request_id) = request_id {
            write = write.with_request_id(request_id);
        }
        let memory = match AssertUnwindSafe(self.memory_writer.write(write))
            .catch_unwind()
            .await
        {
            Ok(memory) => memory,
            Err(panic) => {
                let detail = format!("memory writer panicked: {}", panic_message(panic.as_ref()));
                error!(call_id = %call.id(), tool = call.tool(), detail = %detail, "trace not stored");
                MemoryWriteReport::skipped(detail)
            }
        };

        StepReport {
            result,
            audit: Some(audit),
            memory: Some(memory),
        }
    }
}

/// Builder for [`KernelOrchestrator`].
pub struct OrchestratorBuilder {
    policy: Arc<dyn PolicyEvaluator>,
    ttl: ApprovalTtlPolicy,
    approvals: Option<ApprovalGate>,
    tools: Option<Arc<ToolRegistry>>,
    postconditions: Option<Arc<PostConditionRegistry>>,
    compensation: Option<Arc<CompensationRegistry>>,
    verifier: Option<Arc<dyn VerifierRole>>,
    executor: Option<Arc<dyn ExecutorRole>>,
    planner: Option<Arc<dyn PlannerRole>>,
    auditor: Option<Arc<dyn AuditorRole>>,
    audit: AuditConfig,
    memory_writer: Option<Arc<dyn MemoryWriterRole>>,
    memory: Option<MemoryBus>,
    safe_mode: Option<Arc<SafeModeController>>,
    safe_mode_threshold: u32,
    scheduler: SchedulerConfig,
    observer: Option<Arc<dyn PolicyObserver>>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("ttl", &self.ttl)
            .field("audit", &self.audit)
            .field("safe_mode_threshold", &self.safe_mode_threshold)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    fn new(policy: Arc<dyn PolicyEvaluator>) -> Self {
        let defaults = KernelConfig::default();
        Self {
            policy,
            ttl: defaults.approval.ttl_policy(),
            approvals: None,
            tools: None,
            postconditions: None,
            compensation: None,
            verifier: None,
            executor: None,
            planner: None,
            auditor: None,
            audit: AuditConfig::from_section(&defaults.audit),
            memory_writer: None,
            memory: None,
            safe_mode: None,
            safe_mode_threshold: defaults.safe_mode.error_threshold,
            scheduler: SchedulerConfig::default(),
            observer: None,
            listeners: Vec::new(),
        }
    }

    /// Applies approval TTLs, safe-mode threshold, audit thresholds and the
    /// scheduler limit from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Config`](crate::KernelError::Config) when the
    /// configuration fails validation.
    pub fn config(mut self, config: &KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        self.ttl = config.approval.ttl_policy();
        self.safe_mode_threshold = config.safe_mode.error_threshold;
        self.audit = AuditConfig::from_section(&config.audit);
        self.scheduler = SchedulerConfig::from_section(&config.scheduler)?;
        Ok(self)
    }

    /// Shares an existing approval gate instead of creating one from the TTLs.
    #[must_use]
    pub fn approvals(mut self, gate: ApprovalGate) -> Self {
        self.approvals = Some(gate);
        self
    }

    /// Sets the registry used for steps without an inline handler.
    #[must_use]
    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Sets the postconditions checked by the default verifier.
    #[must_use]
    pub fn postconditions(mut self, registry: Arc<PostConditionRegistry>) -> Self {
        self.postconditions = Some(registry);
        self
    }

    /// Sets the compensation registry.
    #[must_use]
    pub fn compensation(mut self, registry: Arc<CompensationRegistry>) -> Self {
        self.compensation = Some(registry);
        self
    }

    /// Replaces the verifier.
    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn VerifierRole>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replaces the executor. The replacement should share
    /// [`KernelOrchestrator::approvals`] so approval surfaces see its requests.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn ExecutorRole>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the planner.
    #[must_use]
    pub fn planner(mut self, planner: Arc<dyn PlannerRole>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Replaces the auditor.
    #[must_use]
    pub fn auditor(mut self, auditor: Arc<dyn AuditorRole>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// Stores verified traces on the supplied bus.
    #[must_use]
    pub fn memory(mut self, bus: MemoryBus) -> Self {
        self.memory = Some(bus);
        self
    }

    /// Replaces the memory writer.
    #[must_use]
    pub fn memory_writer(mut self, writer: Arc<dyn MemoryWriterRole>) -> Self {
        self.memory_writer = Some(writer);
        self
    }

    /// Shares an existing safe-mode controller.
    #[must_use]
    pub fn safe_mode(mut self, controller: Arc<SafeModeController>) -> Self {
        self.safe_mode = Some(controller);
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

    /// Finalises the orchestrator.
    #[must_use]
    pub fn build(self) -> KernelOrchestrator {
        let approvals = self
            .approvals
            .unwrap_or_else(|| ApprovalGate::new(self.ttl));

        let executor: Arc<dyn ExecutorRole> = if let Some(executor) = self.executor {
            executor
        } else {
            let mut pipeline = ToolExecutionPipeline::builder(self.policy)
                .approvals(approvals.clone())
                .compensation(self.compensation.unwrap_or_default());
            pipeline = match self.verifier {
                Some(verifier) => pipeline.verifier(verifier),
                None => pipeline.postconditions(self.postconditions.unwrap_or_default()),
            };
            if let Some(observer) = self.observer {
                pipeline = pipeline.observer(observer);
            }
            for listener in &self.listeners {
                pipeline = pipeline.state_listener(Arc::clone(listener));
            }
            Arc::new(pipeline.build())
        };

        let (memory_writer, memory): (Arc<dyn MemoryWriterRole>, Option<MemoryBus>) =
            match self.memory_writer {
                Some(writer) => (writer, self.memory),
                None => {
                    let bus = self.memory.unwrap_or_default();
                    (Arc::new(GatedMemoryWriter::new(bus.clone())), Some(bus))
                }
            };

        KernelOrchestrator {
            planner: self.planner.unwrap_or_else(|| Arc::new(DirectPlanner)),
            executor,
            auditor: self
                .auditor
                .unwrap_or_else(|| Arc::new(DriftAuditor::new(self.audit))),
            memory_writer,
            memory,
            safe_mode: self
                .safe_mode
                .unwrap_or_else(|| Arc::new(SafeModeController::new(self.safe_mode_threshold))),
            tools: self.tools.unwrap_or_default(),
            approvals,
            scheduler: TaskScheduler::new(self.scheduler),
            listeners: self.listeners,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_policy::PolicyDecision;
    use agent_policy::RuleBasedEvaluator;
    use agent_tools::{ToolError, ToolMetadata};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::pipeline::PipelineOutcome;
    use crate::roles::DriftKind;
    use crate::state_machine::KernelState;

    fn allow_all() -> Arc<dyn PolicyEvaluator> {
        Arc::new(RuleBasedEvaluator::new(PolicyDecision::allow()))
    }

    fn call(tool: &str) -> ProposedToolCall {
        ProposedToolCall::builder(tool).build().unwrap()
    }

    #[tokio::test]
    async fn empty_request_reports_planning_error() {
        let kernel = KernelOrchestrator::builder(allow_all()).build();
        let result = kernel.handle(KernelRequest::new()).await;
        assert!(!result.is_success());
        assert!(result.steps.is_empty());
        assert_eq!(result.planning_error.as_deref(), Some("request contains no calls"));
    }

    #[tokio::test]
    async fn resolves_registered_tools_and_rejects_unknown_ones() {
        let tools = Arc::new(ToolRegistry::new());
        tools
            .register_tool(
                ToolMetadata::new("fs.read", "1.0.0").unwrap(),
                |_call: ProposedToolCall| async move { Ok::<Value, ToolError>(json!("contents")) },
            )
            .unwrap();
        let kernel = KernelOrchestrator::builder(allow_all()).tools(tools).build();

        let result = kernel
            .handle(KernelRequest::batch([call("fs.read"), call("fs.shred"), call("fs.read")]))
            .await;

        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.halted_at, Some(1));
        assert!(result.steps[0].result.is_success());
        assert!(result.steps[0].memory.as_ref().unwrap().written);
        let rejected = &result.steps[1].result;
        assert_eq!(rejected.outcome, PipelineOutcome::Rejected);
        assert_eq!(
            rejected.primary_failure(),
            Some(&GovernanceFailure::UnknownTool {
                tool: "fs.shred".into()
            })
        );
        assert_eq!(rejected.final_state, KernelState::Idle);
        assert!(result.steps[1].audit.is_none());
    }

    #[tokio::test]
    async fn config_drives_thresholds() {
        let mut config = KernelConfig::default();
        config.safe_mode.error_threshold = 7;
        config.scheduler.max_concurrency = 2;

        let kernel = KernelOrchestrator::builder(allow_all())
            .config(&config)
            .unwrap()
            .build();

        assert_eq!(kernel.safe_mode().threshold(), 7);
        assert_eq!(kernel.scheduler().config().max_concurrency().get(), 2);

        config.scheduler.max_concurrency = 0;
        assert!(KernelOrchestrator::builder(allow_all()).config(&config).is_err());
    }

    struct PanickingAuditor;

    #[async_trait]
    impl AuditorRole for PanickingAuditor {
        async fn audit(&self, _trace: &PipelineResult) -> AuditReport {
            panic!("drift store offline")
        }
    }

    struct PanickingWriter;

    #[async_trait]
    impl MemoryWriterRole for PanickingWriter {
        async fn write(&self, _request: MemoryWriteRequest<'_>) -> MemoryWriteReport {
            panic!("disk full")
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl ExecutorRole for PanickingExecutor {
        async fn execute(
            &self,
            _call: &ProposedToolCall,
            _handler: &dyn ActionHandler,
        ) -> PipelineResult {
            panic!("executor crashed")
        }
    }

    #[tokio::test]
    async fn auditor_and_writer_panics_are_recorded_on_the_step() {
        let kernel = KernelOrchestrator::builder(allow_all())
            .auditor(Arc::new(PanickingAuditor))
            .memory_writer(Arc::new(PanickingWriter))
            .build();
        let handler = |_call: ProposedToolCall| async move { Ok::<Value, ToolError>(json!("done")) };

        let step = kernel.handle_call(&call("fs.read"), &handler).await;

        assert!(step.result.is_success());
        let audit = step.audit.unwrap();
        assert_eq!(audit.findings[0].kind, DriftKind::AuditorFailure);
        assert!(audit.findings[0].detail.contains("drift store offline"));
        assert!(!audit.requires_safe_mode());
        let memory = step.memory.unwrap();
        assert!(!memory.written);
        assert!(memory.reason.unwrap().contains("disk full"));
        assert!(!kernel.safe_mode().is_active());
    }

    #[tokio::test]
    async fn executor_panic_becomes_a_fatal_step() {
        let kernel = KernelOrchestrator::builder(allow_all())
            .executor(Arc::new(PanickingExecutor))
            .build();
        let handler = |_call: ProposedToolCall| async move { Ok::<Value, ToolError>(json!("done")) };

        let step = kernel.handle_call(&call("fs.read"), &handler).await;

        assert_eq!(step.result.outcome, PipelineOutcome::Failed);
        assert_eq!(step.result.final_state, KernelState::Error);
        assert_eq!(
            step.result.primary_failure().map(GovernanceFailure::code),
            Some("fatal_error")
        );
        assert!(step.result.reason_chain().contains("executor crashed"));
        assert_eq!(kernel.safe_mode().consecutive_errors(), 1);
    }
}
