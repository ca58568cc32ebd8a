//! Policy evaluator trait and rule-based implementation.

use std::collections::BTreeSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use agent_primitives::RiskClass;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::contracts::PolicyInput;
use crate::decision::PolicyDecision;

/// Errors surfaced by policy evaluators.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Input failed validation before evaluation.
    #[error("invalid policy input: {0}")]
    InvalidInput(&'static str),
    /// Rule configuration error.
    #[error("invalid policy rule: {0}")]
    InvalidRule(&'static str),
    /// Evaluator has been closed and no longer accepts inputs.
    #[error("policy evaluator closed")]
    Closed,
    /// Backend integration returned an error.
    #[error("policy backend failure: {reason}")]
    Backend {
        /// Human-readable explanation for logging and operators.
        reason: String,
    },
}

impl PolicyError {
    /// Creates a backend error from the supplied reason.
    #[must_use]
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Capability interface implemented by policy evaluators.
///
/// The pipeline gates on [`evaluate`](Self::evaluate) only;
/// [`evaluate_all`](Self::evaluate_all) exists for audit and explainability.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluates the supplied input and returns the gating decision.
    async fn evaluate(&self, input: &PolicyInput) -> PolicyResult<PolicyDecision>;

    /// Returns the decision of every matching policy.
    async fn evaluate_all(&self, input: &PolicyInput) -> PolicyResult<Vec<PolicyDecision>> {
        Ok(vec![self.evaluate(input).await?])
    }

    /// Releases evaluator resources. Later evaluations may fail.
    async fn close(&self) -> PolicyResult<()> {
        Ok(())
    }
}

/// Matches a tool name.
#[derive(Debug, Clone)]
pub enum ToolMatcher {
    /// Match every tool.
    Any,
    /// Match one tool by exact name.
    Named(String),
    /// Match tools whose name starts with the prefix (e.g. `fs.`).
    Prefix(String),
}

impl ToolMatcher {
    fn matches(&self, tool: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Named(name) => name == tool,
            Self::Prefix(prefix) => tool.starts_with(prefix.as_str()),
        }
    }
}

/// Matches a policy input based on tool, minimum risk class, and tags.
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    tool: ToolMatcher,
    min_risk: Option<RiskClass>,
    required_tags: BTreeSet<String>,
}

impl RuleMatcher {
    /// Creates a matcher that accepts all calls.
    #[must_use]
    pub fn any() -> Self {
        Self::with_tool(ToolMatcher::Any)
    }

    /// Creates a matcher targeting a specific tool name.
    #[must_use]
    pub fn for_tool(name: impl Into<String>) -> Self {
        Self::with_tool(ToolMatcher::Named(name.into()))
    }

    /// Creates a matcher targeting every tool under a name prefix.
    #[must_use]
    pub fn for_prefix(prefix: impl Into<String>) -> Self {
        Self::with_tool(ToolMatcher::Prefix(prefix.into()))
    }

    fn with_tool(tool: ToolMatcher) -> Self {
        Self {
            tool,
            min_risk: None,
            required_tags: BTreeSet::new(),
        }
    }

    /// Only matches calls at or above the supplied risk class.
    #[must_use]
    pub fn at_least(mut self, risk: RiskClass) -> Self {
        self.min_risk = Some(risk);
        self
    }

    /// Requires that the input carries the supplied tags.
    #[must_use]
    pub fn with_required_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !tag.trim().is_empty() {
                self.required_tags.insert(tag);
            }
        }
        self
    }

    fn matches(&self, input: &PolicyInput) -> bool {
        self.tool.matches(input.tool())
            && self.min_risk.is_none_or(|min| input.risk_class() >= min)
            && self
                .required_tags
                .iter()
                .all(|tag| input.context().tags().contains(tag))
    }
}

/// Rule consisting of a matcher and a resulting decision.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    name: String,
    matcher: RuleMatcher,
    decision: PolicyDecision,
}

impl PolicyRule {
    /// Creates a new rule. The rule name becomes the decision's policy id.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidRule`] when the rule name is empty.
    pub fn new(
        name: impl Into<String>,
        matcher: RuleMatcher,
        decision: PolicyDecision,
    ) -> PolicyResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PolicyError::InvalidRule("rule name cannot be empty"));
        }

        let decision = decision.with_policy_id(name.clone());
        Ok(Self {
            name,
            matcher,
            decision,
        })
    }

    /// Returns the rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the decision attached to the rule.
    #[must_use]
    pub fn decision(&self) -> &PolicyDecision {
        &self.decision
    }

    fn matches(&self, input: &PolicyInput) -> bool {
        self.matcher.matches(input)
    }
}

/// Rule-based, in-memory policy evaluator. First matching rule wins.
#[derive(Debug)]
pub struct RuleBasedEvaluator {
    rules: RwLock<Vec<PolicyRule>>,
    default_decision: PolicyDecision,
    closed: AtomicBool,
}

impl RuleBasedEvaluator {
    /// Constructs an evaluator with the provided default decision.
    #[must_use]
    pub fn new(default_decision: PolicyDecision) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_decision,
            closed: AtomicBool::new(false),
        }
    }

    /// Adds a rule in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if the internal rule store lock has been poisoned.
    pub fn add_rule(&self, rule: PolicyRule) {
        let mut guard = self.rules.write().expect("policy rules poisoned");
        guard.push(rule);
    }

    /// Adds a rule and returns the evaluator for chaining.
    #[must_use]
    pub fn with_rule(self, rule: PolicyRule) -> Self {
        self.add_rule(rule);
        self
    }

    fn ensure_open(&self) -> PolicyResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PolicyError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyEvaluator for RuleBasedEvaluator {
    async fn evaluate(&self, input: &PolicyInput) -> PolicyResult<PolicyDecision> {
        self.ensure_open()?;
        let guard = self.rules.read().expect("policy rules poisoned");
        for rule in guard.iter() {
            if rule.matches(input) {
                debug!(rule = rule.name(), tool = input.tool(), "policy rule matched");
                return Ok(rule.decision().clone());
            }
        }

        Ok(self.default_decision.clone())
    }

    async fn evaluate_all(&self, input: &PolicyInput) -> PolicyResult<Vec<PolicyDecision>> {
        self.ensure_open()?;
        let guard = self.rules.read().expect("policy rules poisoned");
        let matched: Vec<PolicyDecision> = guard
            .iter()
            .filter(|rule| rule.matches(input))
            .map(|rule| rule.decision().clone())
            .collect();

        if matched.is_empty() {
            return Ok(vec![self.default_decision.clone()]);
        }
        Ok(matched)
    }

    async fn close(&self) -> PolicyResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_primitives::ProposedToolCall;

    fn input_for(tool: &str, risk: RiskClass) -> PolicyInput {
        let call = ProposedToolCall::builder(tool)
            .risk_class(risk)
            .build()
            .unwrap();
        PolicyInput::from_call(&call)
    }

    fn evaluator() -> RuleBasedEvaluator {
        RuleBasedEvaluator::new(PolicyDecision::allow())
            .with_rule(
                PolicyRule::new(
                    "deny-shell",
                    RuleMatcher::for_tool("shell.exec"),
                    PolicyDecision::deny("shell disabled"),
                )
                .unwrap(),
            )
            .with_rule(
                PolicyRule::new(
                    "approve-high-risk",
                    RuleMatcher::any().at_least(RiskClass::High),
                    PolicyDecision::require_approval("high risk", vec!["secops".into()]),
                )
                .unwrap(),
            )
    }

    #[tokio::test]
    async fn rule_matching_prefers_first_match() {
        let engine = evaluator();

        let decision = engine
            .evaluate(&input_for("shell.exec", RiskClass::Critical))
            .await
            .unwrap();
        assert!(decision.is_deny());
        assert_eq!(decision.policy_id(), Some("deny-shell"));

        let decision = engine
            .evaluate(&input_for("fs.write", RiskClass::High))
            .await
            .unwrap();
        assert!(decision.requires_approval());

        let decision = engine
            .evaluate(&input_for("fs.read", RiskClass::Low))
            .await
            .unwrap();
        assert!(decision.allowed());
        assert!(decision.policy_id().is_none());
    }

    #[tokio::test]
    async fn evaluate_all_returns_every_match() {
        let engine = evaluator();
        let decisions = engine
            .evaluate_all(&input_for("shell.exec", RiskClass::Critical))
            .await
            .unwrap();

        let ids: Vec<_> = decisions.iter().filter_map(PolicyDecision::policy_id).collect();
        assert_eq!(ids, ["deny-shell", "approve-high-risk"]);

        let decisions = engine
            .evaluate_all(&input_for("fs.read", RiskClass::Low))
            .await
            .unwrap();
        assert_eq!(decisions, vec![PolicyDecision::allow()]);
    }

    #[tokio::test]
    async fn tag_and_prefix_matching() {
        let engine = RuleBasedEvaluator::new(PolicyDecision::allow()).with_rule(
            PolicyRule::new(
                "fs-write-needs-cap",
                RuleMatcher::for_prefix("fs.").with_required_tags(["cap:write"]),
                PolicyDecision::deny("write capability present but disabled"),
            )
            .unwrap(),
        );

        let call = ProposedToolCall::builder("fs.write")
            .tag("cap:write")
            .build()
            .unwrap();
        let decision = engine.evaluate(&PolicyInput::from_call(&call)).await.unwrap();
        assert!(decision.is_deny());

        let decision = engine
            .evaluate(&input_for("fs.write", RiskClass::Low))
            .await
            .unwrap();
        assert!(decision.allowed());
    }

    #[tokio::test]
    async fn closed_evaluator_rejects_inputs() {
        let engine = evaluator();
        engine.close().await.unwrap();

        let err = engine
            .evaluate(&input_for("fs.read", RiskClass::Low))
            .await
            .expect_err("closed evaluator should fail");
        assert!(matches!(err, PolicyError::Closed));
    }

    #[test]
    fn empty_rule_name_is_rejected() {
        let err = PolicyRule::new(" ", RuleMatcher::any(), PolicyDecision::allow())
            .expect_err("empty name");
        assert!(matches!(err, PolicyError::InvalidRule(_)));
    }
}
