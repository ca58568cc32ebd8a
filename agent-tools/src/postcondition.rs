//! Severity-tagged checks run against a tool's result after execution.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use agent_primitives::ProposedToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::{ToolError, ToolResult};

/// How an unmet postcondition affects the verification report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Failure fails the report and sends the call down the compensation path.
    Critical,
    /// Failure is recorded but the report still passes.
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
        })
    }
}

/// Everything a postcondition may inspect.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationContext {
    call: ProposedToolCall,
    output: Option<Value>,
    execution_error: Option<String>,
}

impl VerificationContext {
    /// Context for a handler that returned an output.
    #[must_use]
    pub fn succeeded(call: ProposedToolCall, output: Value) -> Self {
        Self {
            call,
            output: Some(output),
            execution_error: None,
        }
    }

    /// Context for a handler that reported a failure.
    #[must_use]
    pub fn failed(call: ProposedToolCall, error: impl Into<String>) -> Self {
        Self {
            call,
            output: None,
            execution_error: Some(error.into()),
        }
    }

    /// Returns the executed call.
    #[must_use]
    pub fn call(&self) -> &ProposedToolCall {
        &self.call
    }

    /// Returns the handler output, if the handler succeeded.
    #[must_use]
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Returns the handler error, if the handler failed.
    #[must_use]
    pub fn execution_error(&self) -> Option<&str> {
        self.execution_error.as_deref()
    }
}

type CheckFn = dyn Fn(&VerificationContext) -> bool + Send + Sync;

/// A named check registered for one tool.
#[derive(Clone)]
pub struct PostCondition {
    id: String,
    description: String,
    severity: Severity,
    check: Arc<CheckFn>,
}

impl fmt::Debug for PostCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostCondition")
            .field("id", &self.id)
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

impl PostCondition {
    /// Creates a postcondition.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidMetadata`] when the id is empty.
    pub fn new<F>(
        id: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        check: F,
    ) -> ToolResult<Self>
    where
        F: Fn(&VerificationContext) -> bool + Send + Sync + 'static,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ToolError::InvalidMetadata {
                reason: "postcondition id cannot be empty".into(),
            });
        }
        Ok(Self {
            id,
            description: description.into(),
            severity,
            check: Arc::new(check),
        })
    }

    /// Shorthand for a [`Severity::Critical`] postcondition.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidMetadata`] when the id is empty.
    pub fn critical<F>(
        id: impl Into<String>,
        description: impl Into<String>,
        check: F,
    ) -> ToolResult<Self>
    where
        F: Fn(&VerificationContext) -> bool + Send + Sync + 'static,
    {
        Self::new(id, description, Severity::Critical, check)
    }

    /// Shorthand for a [`Severity::Warning`] postcondition.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidMetadata`] when the id is empty.
    pub fn warning<F>(
        id: impl Into<String>,
        description: impl Into<String>,
        check: F,
    ) -> ToolResult<Self>
    where
        F: Fn(&VerificationContext) -> bool + Send + Sync + 'static,
    {
        Self::new(id, description, Severity::Warning, check)
    }

    /// Returns the postcondition id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the severity.
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Runs the check.
    #[must_use]
    pub fn check(&self, ctx: &VerificationContext) -> CheckOutcome {
        CheckOutcome {
            id: self.id.clone(),
            description: self.description.clone(),
            severity: self.severity,
            passed: (self.check)(ctx),
        }
    }
}

/// Result of a single postcondition check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Postcondition id.
    pub id: String,
    /// Postcondition description.
    pub description: String,
    /// Postcondition severity.
    pub severity: Severity,
    /// Whether the check held.
    pub passed: bool,
}

/// Aggregated verdict over every postcondition registered for a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    passed: bool,
    checks: Vec<CheckOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
}

impl VerificationReport {
    /// Builds a report from individual check outcomes. Only critical failures
    /// fail the report.
    #[must_use]
    pub fn from_checks(checks: Vec<CheckOutcome>) -> Self {
        let failed: Vec<&str> = checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Critical)
            .map(|c| c.id.as_str())
            .collect();
        let failure_reason = (!failed.is_empty())
            .then(|| format!("critical postconditions failed: {}", failed.join(", ")));
        Self {
            passed: failed.is_empty(),
            checks,
            failure_reason,
        }
    }

    /// Report for an execution that never produced an output.
    #[must_use]
    pub fn execution_failed(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            checks: Vec::new(),
            failure_reason: Some(reason.into()),
        }
    }

    /// Returns whether verification passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.passed
    }

    /// Returns every check outcome.
    #[must_use]
    pub fn checks(&self) -> &[CheckOutcome] {
        &self.checks
    }

    /// Returns why verification failed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Returns the failed critical checks.
    pub fn critical_failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Critical)
    }

    /// Returns the failed warning checks.
    pub fn warnings(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks
            .iter()
            .filter(|c| !c.passed && c.severity == Severity::Warning)
    }
}

/// Postconditions keyed by tool name.
#[derive(Default)]
pub struct PostConditionRegistry {
    inner: RwLock<HashMap<String, Vec<PostCondition>>>,
}

impl fmt::Debug for PostConditionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().expect("postcondition registry poisoned");
        let counts: HashMap<&str, usize> =
            inner.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("PostConditionRegistry")
            .field("tools", &counts)
            .finish()
    }
}

impl PostConditionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a postcondition for the named tool, keeping insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidMetadata`] when a postcondition with the
    /// same id is already registered for the tool.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn register(&self, tool: impl Into<String>, condition: PostCondition) -> ToolResult<()> {
        let mut inner = self.inner.write().expect("postcondition registry poisoned");
        let conditions = inner.entry(tool.into()).or_default();
        if conditions.iter().any(|c| c.id == condition.id) {
            return Err(ToolError::InvalidMetadata {
                reason: format!("postcondition `{}` already registered", condition.id),
            });
        }
        conditions.push(condition);
        Ok(())
    }

    /// Registers a postcondition and returns the registry for chaining.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn with(self, tool: impl Into<String>, condition: PostCondition) -> ToolResult<Self> {
        self.register(tool, condition)?;
        Ok(self)
    }

    /// Returns the postconditions registered for the tool.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn for_tool(&self, tool: &str) -> Vec<PostCondition> {
        let inner = self.inner.read().expect("postcondition registry poisoned");
        inner.get(tool).cloned().unwrap_or_default()
    }

    /// Runs every postcondition registered for the call's tool.
    ///
    /// A context carrying an execution error fails without running checks.
    #[must_use]
    pub fn verify(&self, ctx: &VerificationContext) -> VerificationReport {
        if let Some(error) = ctx.execution_error() {
            return VerificationReport::execution_failed(format!("execution failed: {error}"));
        }

        let checks: Vec<CheckOutcome> = self
            .for_tool(ctx.call().tool())
            .iter()
            .map(|condition| condition.check(ctx))
            .collect();
        let report = VerificationReport::from_checks(checks);

        for warning in report.warnings() {
            warn!(
                tool = ctx.call().tool(),
                postcondition = %warning.id,
                "warning postcondition unmet"
            );
        }
        debug!(
            tool = ctx.call().tool(),
            checks = report.checks().len(),
            passed = report.passed(),
            "postconditions evaluated"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(output: Value) -> VerificationContext {
        let call = ProposedToolCall::builder("media.generate").build().unwrap();
        VerificationContext::succeeded(call, output)
    }

    fn registry() -> PostConditionRegistry {
        PostConditionRegistry::new()
            .with(
                "media.generate",
                PostCondition::critical("has-asset", "output names an asset", |ctx| {
                    ctx.output().and_then(|o| o.get("asset_id")).is_some()
                })
                .unwrap(),
            )
            .unwrap()
            .with(
                "media.generate",
                PostCondition::warning("fast", "generation under 5s", |ctx| {
                    ctx.output()
                        .and_then(|o| o.get("elapsed_ms"))
                        .and_then(Value::as_u64)
                        .is_some_and(|ms| ms < 5000)
                })
                .unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn warnings_do_not_fail_report() {
        let report = registry().verify(&ctx(json!({ "asset_id": "a1", "elapsed_ms": 9000 })));
        assert!(report.passed());
        assert_eq!(report.warnings().count(), 1);
        assert_eq!(report.critical_failures().count(), 0);
    }

    #[test]
    fn critical_failure_fails_report() {
        let report = registry().verify(&ctx(json!({ "elapsed_ms": 10 })));
        assert!(!report.passed());
        let failed: Vec<_> = report.critical_failures().map(|c| c.id.as_str()).collect();
        assert_eq!(failed, ["has-asset"]);
        assert!(report.failure_reason().unwrap().contains("has-asset"));
    }

    #[test]
    fn tools_without_postconditions_pass() {
        let call = ProposedToolCall::builder("fs.read").build().unwrap();
        let report = registry().verify(&VerificationContext::succeeded(call, Value::Null));
        assert!(report.passed());
        assert!(report.checks().is_empty());
    }

    #[test]
    fn execution_error_fails_without_running_checks() {
        let call = ProposedToolCall::builder("media.generate").build().unwrap();
        let report = registry().verify(&VerificationContext::failed(call, "disk full"));
        assert!(!report.passed());
        assert!(report.checks().is_empty());
        assert!(report.failure_reason().unwrap().contains("disk full"));
    }

    #[test]
    fn duplicate_ids_are_rejected_per_tool() {
        let registry = registry();
        let err = registry
            .register(
                "media.generate",
                PostCondition::critical("has-asset", "again", |_| true).unwrap(),
            )
            .expect_err("duplicate id");
        assert!(matches!(err, ToolError::InvalidMetadata { .. }));

        registry
            .register("media.delete", PostCondition::critical("has-asset", "other tool", |_| true).unwrap())
            .unwrap();
    }
}
