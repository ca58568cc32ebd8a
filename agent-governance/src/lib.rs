//! Governance for autonomous agent tool calls.
//!
//! Bundles the workspace crates behind feature flags. The default `kernel`
//! feature pulls in everything needed to run calls through the
//! [`KernelOrchestrator`](kernel::KernelOrchestrator); `telemetry` adds the
//! tracing subscriber setup.

#![warn(missing_docs, clippy::pedantic)]

/// Identifiers, risk classes and the proposed call type.
pub use agent_primitives as primitives;

/// State machine, pipeline, role layer and orchestrator (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use agent_kernel as kernel;

/// Action handlers, postconditions and compensation (enabled by `tools` feature).
#[cfg(feature = "tools")]
pub use agent_tools as tools;

/// Trace store (enabled by `memory` feature).
#[cfg(feature = "memory")]
pub use agent_memory as memory;

/// Policy evaluation and the approval gate (enabled by `policy` feature).
#[cfg(feature = "policy")]
pub use agent_policy as policy;

/// Tracing subscriber initialisation (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use agent_telemetry as telemetry;

/// TOML configuration (enabled by `config` feature).
#[cfg(feature = "config")]
pub use agent_config as config;

/// Items most embedders need to stand up a governed kernel.
#[cfg(feature = "kernel")]
pub mod prelude {
    pub use agent_config::KernelConfig;
    pub use agent_kernel::{
        GovernanceFailure, KernelOrchestrator, KernelRequest, OrchestratedResult,
        PipelineOutcome, PipelineResult, SafeModeStatus,
    };
    pub use agent_policy::{
        ApprovalDecision, ApprovalGate, PolicyDecision, PolicyEvaluator, PolicyRule,
        RuleBasedEvaluator, RuleMatcher,
    };
    pub use agent_primitives::{ProposedToolCall, RiskClass};
    pub use agent_tools::{
        ActionHandler, CompensationOutcome, CompensationRegistry, PostCondition,
        PostConditionRegistry, ToolMetadata, ToolRegistry,
    };
}
