//! Plan materialisation seam.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use agent_primitives::{CallId, ProposedToolCall};
use agent_tools::ActionHandler;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// One call submitted to the orchestrator, with an optional inline handler.
#[derive(Clone)]
pub struct RequestedCall {
    call: ProposedToolCall,
    handler: Option<Arc<dyn ActionHandler>>,
}

impl fmt::Debug for RequestedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestedCall")
            .field("call", &self.call)
            .field("inline_handler", &self.handler.is_some())
            .finish()
    }
}

impl RequestedCall {
    /// Returns the proposed call.
    #[must_use]
    pub fn call(&self) -> &ProposedToolCall {
        &self.call
    }

    /// Returns the inline handler, if any.
    #[must_use]
    pub fn handler(&self) -> Option<&Arc<dyn ActionHandler>> {
        self.handler.as_ref()
    }
}

/// Request handed to [`KernelOrchestrator::handle`](crate::KernelOrchestrator::handle).
#[derive(Debug, Clone)]
pub struct KernelRequest {
    id: Uuid,
    intent: Option<String>,
    calls: Vec<RequestedCall>,
}

impl Default for KernelRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            intent: None,
            calls: Vec::new(),
        }
    }

    /// Request for a single call resolved through the tool registry.
    #[must_use]
    pub fn single(call: ProposedToolCall) -> Self {
        Self::new().with_call(call)
    }

    /// Request for several calls executed in order.
    #[must_use]
    pub fn batch<I>(calls: I) -> Self
    where
        I: IntoIterator<Item = ProposedToolCall>,
    {
        calls.into_iter().fold(Self::new(), Self::with_call)
    }

    /// Appends a call resolved through the tool registry.
    #[must_use]
    pub fn with_call(mut self, call: ProposedToolCall) -> Self {
        self.calls.push(RequestedCall { call, handler: None });
        self
    }

    /// Appends a call executed by the supplied handler.
    #[must_use]
    pub fn with_handler<H>(mut self, call: ProposedToolCall, handler: H) -> Self
    where
        H: ActionHandler + 'static,
    {
        self.calls.push(RequestedCall {
            call,
            handler: Some(Arc::new(handler)),
        });
        self
    }

    /// Records what the caller is trying to achieve.
    #[must_use]
    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    /// Returns the request identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the stated intent.
    #[must_use]
    pub fn intent(&self) -> Option<&str> {
        self.intent.as_deref()
    }

    /// Returns the requested calls in submission order.
    #[must_use]
    pub fn calls(&self) -> &[RequestedCall] {
        &self.calls
    }
}

/// One ordered step of an [`ExecutionPlan`].
#[derive(Clone)]
pub struct PlanStep {
    /// Zero-based position in the plan.
    pub index: usize,
    /// Call to govern.
    pub call: ProposedToolCall,
    /// Inline handler; `None` resolves through the tool registry.
    pub handler: Option<Arc<dyn ActionHandler>>,
}

impl fmt::Debug for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanStep")
            .field("index", &self.index)
            .field("call", &self.call)
            .field("inline_handler", &self.handler.is_some())
            .finish()
    }
}

/// Ordered steps produced by a planner.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Request the plan was produced for.
    pub request_id: Uuid,
    /// Intent copied from the request.
    pub intent: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Returns `true` when the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

/// Planning failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Request carried no calls.
    #[error("request contains no calls")]
    EmptyRequest,
    /// The same call id appears twice.
    #[error("call {0} appears more than once")]
    DuplicateCall(CallId),
    /// Planner-specific failure.
    #[error("planner failed: {reason}")]
    Planner {
        /// Human-readable reason.
        reason: String,
    },
}

/// Turns a request into an ordered plan.
#[async_trait]
pub trait PlannerRole: Send + Sync {
    /// Materialises the plan.
    async fn plan(&self, request: &KernelRequest) -> Result<ExecutionPlan, PlanError>;
}

/// Planner that maps each requested call to one step, in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectPlanner;

#[async_trait]
impl PlannerRole for DirectPlanner {
    async fn plan(&self, request: &KernelRequest) -> Result<ExecutionPlan, PlanError> {
        if request.calls.is_empty() {
            return Err(PlanError::EmptyRequest);
        }
        let mut seen = HashSet::with_capacity(request.calls.len());
        let mut steps = Vec::with_capacity(request.calls.len());
        for (index, requested) in request.calls.iter().enumerate() {
            if !seen.insert(requested.call.id()) {
                return Err(PlanError::DuplicateCall(requested.call.id()));
            }
            steps.push(PlanStep {
                index,
                call: requested.call.clone(),
                handler: requested.handler.clone(),
            });
        }
        Ok(ExecutionPlan {
            request_id: request.id,
            intent: request.intent.clone(),
            steps,
        })
    }
}
