//! Integrations with external governance systems.

use std::sync::Arc;

use async_trait::async_trait;

use crate::contracts::PolicyInput;
use crate::decision::PolicyDecision;
use crate::engine::{PolicyEvaluator, PolicyResult};

/// Trait implemented by remote governance backends.
#[async_trait]
pub trait GovernanceClient: Send + Sync {
    /// Evaluates the supplied input and returns the backend's gating decision.
    async fn evaluate(&self, input: &PolicyInput) -> PolicyResult<PolicyDecision>;

    /// Returns every decision the backend considers relevant.
    async fn explain(&self, input: &PolicyInput) -> PolicyResult<Vec<PolicyDecision>> {
        Ok(vec![self.evaluate(input).await?])
    }

    /// Closes the underlying connection.
    async fn shutdown(&self) -> PolicyResult<()> {
        Ok(())
    }
}

/// Policy evaluator adapter that delegates to a remote governance client.
#[derive(Clone)]
pub struct RemotePolicyEvaluator<C>
where
    C: GovernanceClient + 'static,
{
    client: Arc<C>,
}

impl<C> RemotePolicyEvaluator<C>
where
    C: GovernanceClient + 'static,
{
    /// Creates a new remote evaluator using the provided client.
    #[must_use]
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C> PolicyEvaluator for RemotePolicyEvaluator<C>
where
    C: GovernanceClient + 'static,
{
    async fn evaluate(&self, input: &PolicyInput) -> PolicyResult<PolicyDecision> {
        self.client.evaluate(input).await
    }

    async fn evaluate_all(&self, input: &PolicyInput) -> PolicyResult<Vec<PolicyDecision>> {
        self.client.explain(input).await
    }

    async fn close(&self) -> PolicyResult<()> {
        self.client.shutdown().await
    }
}
