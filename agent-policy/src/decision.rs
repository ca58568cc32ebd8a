//! Policy decision types returned by evaluators.

use serde::{Deserialize, Serialize};

/// Describes the outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Call may execute without further intervention.
    Allow,
    /// Call is rejected outright; no approval escalation is possible.
    Deny,
    /// Call is allowed only once a human approves it.
    RequireApproval,
}

/// Structured decision emitted by a policy evaluator.
///
/// Decisions are produced fresh per evaluation and never persisted by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    kind: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    policy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    required_approvals: Vec<String>,
}

impl PolicyDecision {
    /// Returns an allow decision with no additional context.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            kind: DecisionKind::Allow,
            reason: None,
            policy_id: None,
            required_approvals: Vec::new(),
        }
    }

    /// Returns a deny decision with an explanatory reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Deny,
            reason: Some(reason.into()),
            policy_id: None,
            required_approvals: Vec::new(),
        }
    }

    /// Returns a decision that allows the call once approved by a human.
    #[must_use]
    pub fn require_approval(reason: impl Into<String>, approvers: Vec<String>) -> Self {
        Self {
            kind: DecisionKind::RequireApproval,
            reason: Some(reason.into()),
            policy_id: None,
            required_approvals: approvers,
        }
    }

    /// Attaches the identifier of the policy that produced the decision.
    #[must_use]
    pub fn with_policy_id(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    /// Returns the decision kind.
    #[must_use]
    pub fn kind(&self) -> DecisionKind {
        self.kind
    }

    /// Returns true unless the decision is a hard deny.
    #[must_use]
    pub fn allowed(&self) -> bool {
        self.kind != DecisionKind::Deny
    }

    /// Returns true when the call must be escalated to the approval gate.
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        self.kind == DecisionKind::RequireApproval
    }

    /// Returns true when the decision denies the call.
    #[must_use]
    pub fn is_deny(&self) -> bool {
        self.kind == DecisionKind::Deny
    }

    /// Returns the optional reason associated with the decision.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Returns the identifier of the policy that produced the decision.
    #[must_use]
    pub fn policy_id(&self) -> Option<&str> {
        self.policy_id.as_deref()
    }

    /// Returns approver identifiers suggested for approval decisions.
    #[must_use]
    pub fn required_approvals(&self) -> &[String] {
        &self.required_approvals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_helpers_work() {
        let allow = PolicyDecision::allow();
        assert!(allow.allowed());
        assert!(!allow.requires_approval());

        let deny = PolicyDecision::deny("blocked").with_policy_id("no-shell");
        assert!(deny.is_deny());
        assert!(!deny.allowed());
        assert_eq!(deny.reason(), Some("blocked"));
        assert_eq!(deny.policy_id(), Some("no-shell"));

        let gated = PolicyDecision::require_approval("needs approval", vec!["secops".into()]);
        assert!(gated.allowed());
        assert!(gated.requires_approval());
        assert_eq!(gated.required_approvals(), ["secops"]);
    }

    #[test]
    fn serializes_with_snake_case_kind() {
        let value = serde_json::to_value(PolicyDecision::require_approval("x", Vec::new())).unwrap();
        assert_eq!(value["kind"], "require_approval");
        assert!(value.get("policy_id").is_none());
    }
}
