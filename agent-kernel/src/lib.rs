//! Governance kernel for agent tool calls.
//!
//! Every call proposed by an agent is validated, checked against policy,
//! optionally parked for human approval, executed, verified against
//! postconditions and, when verification fails, compensated. The
//! [`KernelStateMachine`] tracks one call's lifecycle, the
//! [`ToolExecutionPipeline`] drives it, and the [`KernelOrchestrator`] composes
//! the role layer (planning, auditing, safe mode, trace persistence) around the
//! pipeline as the single external entry point.

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod observer;
pub mod orchestrator;
pub mod pipeline;
pub mod roles;
pub mod scheduler;
pub mod state_machine;

pub use error::{KernelError, KernelResult};
pub use observer::{
    CompositePolicyObserver, PolicyObserver, TracingPolicyObserver, TracingStateListener,
};
pub use orchestrator::{KernelOrchestrator, OrchestratedResult, OrchestratorBuilder, StepReport};
pub use pipeline::{
    GovernanceFailure, PipelineBuilder, PipelineOutcome, PipelineResult, PipelineTiming,
    ToolExecutionPipeline,
};
pub use roles::{
    AuditConfig, AuditReport, AuditorRole, DirectPlanner, DriftAuditor, DriftFinding, DriftKind,
    ExecutionPlan, ExecutorRole, GatedMemoryWriter, KernelRequest, MemoryWriteReport,
    MemoryWriteRequest, MemoryWriterRole, PlanError, PlanStep, PlannerRole,
    PostConditionVerifier, RequestedCall, SafeModeController, SafeModeError, SafeModeEvent,
    SafeModeEventKind, SafeModeStatus, VerifierRole,
};
pub use scheduler::{SchedulerConfig, SchedulerError, SchedulerResult, TaskScheduler};
pub use state_machine::{
    KernelState, KernelStateMachine, ListenerId, StateListener, StateMatch, StateTransition,
    TRANSITIONS, TransitionResult, Trigger,
};
