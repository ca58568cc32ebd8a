//! Saga-style compensation for effects that failed verification.
//!
//! The eligibility table is authoritative: a registered [`CompensationFn`] is
//! only ever run for tools whose eligibility says [`CompensationStrategy::Automated`].
//! Tools without an entry are treated as manual.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use agent_primitives::ProposedToolCall;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::postcondition::VerificationReport;

/// Rollback strategy for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// Rollback is mechanical; run the registered compensation function.
    Automated,
    /// Rollback needs a human; flag the call for remediation.
    Manual,
}

impl fmt::Display for CompensationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Automated => "automated",
            Self::Manual => "manual",
        })
    }
}

/// Static per-tool rollback metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationEligibility {
    tool_name: String,
    strategy: CompensationStrategy,
    rationale: String,
}

impl CompensationEligibility {
    /// Marks the tool as mechanically reversible.
    #[must_use]
    pub fn automated(tool_name: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            strategy: CompensationStrategy::Automated,
            rationale: rationale.into(),
        }
    }

    /// Marks the tool as requiring human remediation.
    #[must_use]
    pub fn manual(tool_name: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            strategy: CompensationStrategy::Manual,
            rationale: rationale.into(),
        }
    }

    /// Returns the tool name.
    #[must_use]
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// Returns the strategy.
    #[must_use]
    pub fn strategy(&self) -> CompensationStrategy {
        self.strategy
    }

    /// Returns why the strategy was chosen.
    #[must_use]
    pub fn rationale(&self) -> &str {
        &self.rationale
    }
}

/// Input handed to a compensation function.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationContext {
    /// The call whose effect must be reversed.
    pub call: ProposedToolCall,
    /// Output returned by the action handler, if any.
    pub output: Option<Value>,
    /// The failed verification that triggered compensation.
    pub verification: VerificationReport,
}

/// Result reported by a compensation function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationOutcome {
    /// Whether the rollback succeeded.
    pub success: bool,
    /// Human-readable detail for operators.
    pub detail: String,
}

impl CompensationOutcome {
    /// Successful rollback.
    #[must_use]
    pub fn succeeded(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    /// Failed rollback.
    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// Best-effort reversing action for one tool.
#[async_trait]
pub trait CompensationFn: Send + Sync {
    /// Attempts to reverse the effect described by the context.
    async fn compensate(&self, ctx: &CompensationContext) -> CompensationOutcome;
}

#[async_trait]
impl<F, Fut> CompensationFn for F
where
    F: Send + Sync + Fn(CompensationContext) -> Fut,
    Fut: Future<Output = CompensationOutcome> + Send,
{
    async fn compensate(&self, ctx: &CompensationContext) -> CompensationOutcome {
        (self)(ctx.clone()).await
    }
}

/// What the pipeline did about a failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationReport {
    /// Strategy taken from the eligibility table.
    pub strategy: CompensationStrategy,
    /// Rationale recorded in the eligibility table.
    pub rationale: String,
    /// Whether a compensation function ran.
    pub attempted: bool,
    /// Outcome of the compensation function, when one ran or should have.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CompensationOutcome>,
}

impl CompensationReport {
    /// Returns true when an automated rollback ran and succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().is_some_and(|o| o.success)
    }

    /// Returns true when the call was flagged for a human.
    #[must_use]
    pub fn needs_remediation(&self) -> bool {
        self.strategy == CompensationStrategy::Manual
    }
}

/// Tool name to eligibility and compensation function.
#[derive(Default)]
pub struct CompensationRegistry {
    eligibility: RwLock<HashMap<String, CompensationEligibility>>,
    functions: RwLock<HashMap<String, Arc<dyn CompensationFn>>>,
}

impl fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let eligibility = self.eligibility.read().expect("compensation registry poisoned");
        let functions = self.functions.read().expect("compensation registry poisoned");
        f.debug_struct("CompensationRegistry")
            .field("eligibility", &eligibility.values().collect::<Vec<_>>())
            .field("functions", &functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CompensationRegistry {
    /// Creates an empty registry; every tool starts out manual.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records eligibility for a tool, replacing any previous entry.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn set_eligibility(&self, eligibility: CompensationEligibility) {
        let mut guard = self.eligibility.write().expect("compensation registry poisoned");
        guard.insert(eligibility.tool_name.clone(), eligibility);
    }

    /// Registers the compensation function for a tool.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn register_fn<C>(&self, tool: impl Into<String>, compensation: C)
    where
        C: CompensationFn + 'static,
    {
        let mut guard = self.functions.write().expect("compensation registry poisoned");
        guard.insert(tool.into(), Arc::new(compensation));
    }

    /// Marks the tool as automated and registers its compensation function.
    pub fn register_automated<C>(
        &self,
        tool: impl Into<String>,
        rationale: impl Into<String>,
        compensation: C,
    ) where
        C: CompensationFn + 'static,
    {
        let tool = tool.into();
        self.set_eligibility(CompensationEligibility::automated(tool.clone(), rationale));
        self.register_fn(tool, compensation);
    }

    /// Returns the eligibility for a tool, defaulting to manual.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn eligibility(&self, tool: &str) -> CompensationEligibility {
        let guard = self.eligibility.read().expect("compensation registry poisoned");
        guard.get(tool).cloned().unwrap_or_else(|| {
            CompensationEligibility::manual(tool, "no eligibility entry; reversibility not assumed")
        })
    }

    /// Returns the compensation function registered for a tool.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn function(&self, tool: &str) -> Option<Arc<dyn CompensationFn>> {
        let guard = self.functions.read().expect("compensation registry poisoned");
        guard.get(tool).cloned()
    }
}
