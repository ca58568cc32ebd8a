//! Postcondition verification seam.

use std::sync::Arc;

use agent_tools::{PostConditionRegistry, VerificationContext, VerificationReport};
use async_trait::async_trait;

/// Checks a call's result after execution.
#[async_trait]
pub trait VerifierRole: Send + Sync {
    /// Aggregates postcondition checks into a report.
    async fn verify(&self, ctx: &VerificationContext) -> VerificationReport;
}

/// Verifier backed by a [`PostConditionRegistry`].
#[derive(Debug, Clone, Default)]
pub struct PostConditionVerifier {
    registry: Arc<PostConditionRegistry>,
}

impl PostConditionVerifier {
    /// Creates a verifier over the supplied registry.
    #[must_use]
    pub fn new(registry: Arc<PostConditionRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PostConditionRegistry> {
        &self.registry
    }
}

#[async_trait]
impl VerifierRole for PostConditionVerifier {
    async fn verify(&self, ctx: &VerificationContext) -> VerificationReport {
        self.registry.verify(ctx)
    }
}
