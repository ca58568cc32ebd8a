//! Governance policy evaluation and human approval for agent tool calls.
//!
//! The pipeline consumes two collaborators from this crate: a
//! [`PolicyEvaluator`] producing one [`PolicyDecision`] per call, and the shared
//! [`ApprovalGate`] that parks calls needing a human decision until they are
//! resolved or their risk-tiered deadline passes.

#![warn(missing_docs, clippy::pedantic)]

pub mod approval;
pub mod contracts;
pub mod decision;
pub mod engine;
pub mod integrations;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalGateConfig, ApprovalHandle, ApprovalRequest,
    ApprovalResolver, ApprovalResult, ApprovalStatus, ApprovalTtlPolicy,
};
pub use contracts::{PolicyContext, PolicyInput};
pub use decision::{DecisionKind, PolicyDecision};
pub use engine::{
    PolicyError, PolicyEvaluator, PolicyResult, PolicyRule, RuleBasedEvaluator, RuleMatcher,
    ToolMatcher,
};
pub use integrations::{GovernanceClient, RemotePolicyEvaluator};
