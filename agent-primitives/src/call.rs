//! Proposed tool calls submitted to the governance kernel.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::{AgentId, CallId, RiskClass};

const MAX_TOOL_NAME_LEN: usize = 96;

/// A single tool invocation proposed by an agent.
///
/// Calls are immutable once built; the pipeline only ever reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedToolCall {
    id: CallId,
    tool: String,
    #[serde(default)]
    input: Value,
    source: AgentId,
    risk_class: RiskClass,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    tags: BTreeSet<String>,
    created_at: DateTime<Utc>,
}

impl ProposedToolCall {
    /// Starts building a call for the named tool.
    #[must_use]
    pub fn builder(tool: impl Into<String>) -> ProposedToolCallBuilder {
        ProposedToolCallBuilder {
            id: None,
            tool: tool.into(),
            input: Value::Null,
            source: None,
            risk_class: RiskClass::default(),
            tags: BTreeSet::new(),
        }
    }

    /// Returns the call identifier.
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Returns the name of the tool to invoke.
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Returns the input payload handed to the action handler.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Returns the agent that proposed the call.
    #[must_use]
    pub fn source(&self) -> AgentId {
        self.source
    }

    /// Returns the declared risk class.
    #[must_use]
    pub fn risk_class(&self) -> RiskClass {
        self.risk_class
    }

    /// Returns the free-form tags attached by the proposer.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Builder for [`ProposedToolCall`].
#[derive(Debug)]
pub struct ProposedToolCallBuilder {
    id: Option<CallId>,
    tool: String,
    input: Value,
    source: Option<AgentId>,
    risk_class: RiskClass,
    tags: BTreeSet<String>,
}

impl ProposedToolCallBuilder {
    /// Overrides the generated call identifier.
    #[must_use]
    pub fn id(mut self, id: CallId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the input payload.
    #[must_use]
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Sets the proposing agent.
    #[must_use]
    pub fn source(mut self, source: AgentId) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the risk class.
    #[must_use]
    pub fn risk_class(mut self, risk_class: RiskClass) -> Self {
        self.risk_class = risk_class;
        self
    }

    /// Adds a tag, ignoring empty or whitespace-only strings.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !tag.trim().is_empty() {
            self.tags.insert(tag);
        }
        self
    }

    /// Adds multiple tags.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self = self.tag(tag);
        }
        self
    }

    /// Validates the builder and produces the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToolName`] when the tool name is empty, too long,
    /// or contains whitespace or control characters.
    pub fn build(self) -> Result<ProposedToolCall> {
        validate_tool_name(&self.tool)?;
        Ok(ProposedToolCall {
            id: self.id.unwrap_or_else(CallId::random),
            tool: self.tool,
            input: self.input,
            source: self.source.unwrap_or_else(AgentId::random),
            risk_class: self.risk_class,
            tags: self.tags,
            created_at: Utc::now(),
        })
    }
}

fn validate_tool_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidToolName {
            name: name.to_owned(),
            reason: "tool name cannot be empty".into(),
        });
    }

    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(Error::InvalidToolName {
            name: name.to_owned(),
            reason: format!("tool name length must be <= {MAX_TOOL_NAME_LEN}"),
        });
    }

    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidToolName {
            name: name.to_owned(),
            reason: "tool name cannot contain whitespace or control characters".into(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_populates_fields() {
        let source = AgentId::random();
        let call = ProposedToolCall::builder("media.generate")
            .input(json!({ "prompt": "cat" }))
            .source(source)
            .risk_class(RiskClass::High)
            .tags(["media", " ", "generated"])
            .build()
            .unwrap();

        assert_eq!(call.tool(), "media.generate");
        assert_eq!(call.source(), source);
        assert_eq!(call.risk_class(), RiskClass::High);
        assert_eq!(call.tags().len(), 2);
        assert_eq!(call.input()["prompt"], "cat");
    }

    #[test]
    fn rejects_invalid_tool_names() {
        for name in ["", "   ", "two words", "tab\tname"] {
            let err = ProposedToolCall::builder(name).build().expect_err(name);
            assert!(matches!(err, Error::InvalidToolName { .. }));
        }

        let long = "x".repeat(MAX_TOOL_NAME_LEN + 1);
        assert!(ProposedToolCall::builder(long).build().is_err());
    }
}
