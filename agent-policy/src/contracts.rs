//! Policy input contracts for governance evaluation.

use std::collections::BTreeSet;

use agent_primitives::{ProposedToolCall, RiskClass};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context supplied to a policy evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyContext {
    metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    tags: BTreeSet<String>,
}

impl PolicyContext {
    /// Inserts metadata into the context.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Adds a tag to the context, ignoring empty or whitespace-only strings.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !tag.trim().is_empty() {
            self.tags.insert(tag);
        }
    }

    /// Extends the context with multiple tags.
    pub fn extend_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.add_tag(tag);
        }
    }

    /// Returns the metadata associated with the context.
    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Returns the tags associated with the context.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

/// Full input handed to a [`PolicyEvaluator`](crate::PolicyEvaluator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInput {
    call: ProposedToolCall,
    #[serde(default)]
    context: PolicyContext,
}

impl PolicyInput {
    /// Builds an input for the supplied call, seeding the context with the
    /// call's tags, risk class, and source.
    #[must_use]
    pub fn from_call(call: &ProposedToolCall) -> Self {
        let mut context = PolicyContext::default();
        context.extend_tags(call.tags().iter().cloned());
        context.add_tag(format!("risk:{}", call.risk_class()));
        context.insert_metadata("source", Value::from(call.source().to_string()));
        context.insert_metadata("risk_class", Value::from(call.risk_class().as_str()));

        Self {
            call: call.clone(),
            context,
        }
    }

    /// Returns the call under evaluation.
    #[must_use]
    pub fn call(&self) -> &ProposedToolCall {
        &self.call
    }

    /// Shorthand for the tool name of the call.
    #[must_use]
    pub fn tool(&self) -> &str {
        self.call.tool()
    }

    /// Shorthand for the risk class of the call.
    #[must_use]
    pub fn risk_class(&self) -> RiskClass {
        self.call.risk_class()
    }

    /// Returns the evaluation context.
    #[must_use]
    pub fn context(&self) -> &PolicyContext {
        &self.context
    }

    /// Returns a mutable reference to the context.
    pub fn context_mut(&mut self) -> &mut PolicyContext {
        &mut self.context
    }

    /// Adds metadata to the context.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert_metadata(key, value);
        self
    }

    /// Adds a tag to the context.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.context.add_tag(tag);
        self
    }
}
