//! Tool execution collaborators for the governance pipeline.
//!
//! Three registries live here, each keyed by tool name: action handlers that
//! perform the effect, postconditions that verify it, and compensation
//! functions that reverse it when verification fails.

#![warn(missing_docs, clippy::pedantic)]

pub mod compensation;
pub mod postcondition;
pub mod registry;

pub use compensation::{
    CompensationContext, CompensationEligibility, CompensationFn, CompensationOutcome,
    CompensationRegistry, CompensationReport, CompensationStrategy,
};
pub use postcondition::{
    CheckOutcome, PostCondition, PostConditionRegistry, Severity, VerificationContext,
    VerificationReport,
};
pub use registry::{ActionHandler, ToolError, ToolHandle, ToolMetadata, ToolRegistry, ToolResult};
