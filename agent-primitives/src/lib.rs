//! Core shared types for governed tool execution.

#![warn(missing_docs, clippy::pedantic)]

mod call;
mod error;
mod ids;
mod risk;

/// Proposed tool calls flowing through the governance pipeline.
pub use call::{ProposedToolCall, ProposedToolCallBuilder};
/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Identifiers for agents, calls, and approval requests.
pub use ids::{AgentId, ApprovalId, CallId};
/// Tiered sensitivity labels attached to tool calls.
pub use risk::RiskClass;
