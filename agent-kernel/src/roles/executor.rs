//! Execution seam in front of the governance pipeline.

use agent_primitives::ProposedToolCall;
use agent_tools::ActionHandler;
use async_trait::async_trait;

use crate::pipeline::{PipelineResult, ToolExecutionPipeline};

/// Runs one call through governance. Implementations must be total.
#[async_trait]
pub trait ExecutorRole: Send + Sync {
    /// Governs and executes the call, encoding every failure in the result.
    async fn execute(&self, call: &ProposedToolCall, handler: &dyn ActionHandler)
    -> PipelineResult;
}

#[async_trait]
impl ExecutorRole for ToolExecutionPipeline {
    async fn execute(
        &self,
        call: &ProposedToolCall,
        handler: &dyn ActionHandler,
    ) -> PipelineResult {
        ToolExecutionPipeline::execute(self, call, handler).await
    }
}
