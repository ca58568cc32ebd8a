//! Runtime registry for tool metadata and action handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use agent_primitives::{ProposedToolCall, RiskClass};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result alias for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;

/// Metadata describing a registered tool.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolMetadata {
    name: String,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    risk_class: RiskClass,
}

impl ToolMetadata {
    /// Creates metadata for the supplied identifier and version.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidMetadata`] if either field is empty.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> ToolResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ToolError::InvalidMetadata {
                reason: "tool name cannot be empty".into(),
            });
        }

        let version = version.into();
        if version.trim().is_empty() {
            return Err(ToolError::InvalidMetadata {
                reason: "tool version cannot be empty".into(),
            });
        }

        Ok(Self {
            name,
            version,
            description: None,
            risk_class: RiskClass::default(),
        })
    }

    /// Sets the human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the risk class the tool is registered under.
    #[must_use]
    pub fn with_risk_class(mut self, risk_class: RiskClass) -> Self {
        self.risk_class = risk_class;
        self
    }

    /// Returns the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the semantic version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the optional description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the registered risk class.
    #[must_use]
    pub fn risk_class(&self) -> RiskClass {
        self.risk_class
    }
}

/// Effectful code invoked once a call has cleared policy and approval.
///
/// The returned payload is opaque to the kernel and only inspected by
/// postconditions.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Runs the tool for the supplied call.
    async fn invoke(&self, call: &ProposedToolCall) -> ToolResult<Value>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Send + Sync + Fn(ProposedToolCall) -> Fut,
    Fut: Future<Output = ToolResult<Value>> + Send,
{
    async fn invoke(&self, call: &ProposedToolCall) -> ToolResult<Value> {
        (self)(call.clone()).await
    }
}

/// Handle returned by the registry for direct invocation.
#[derive(Clone)]
pub struct ToolHandle {
    metadata: ToolMetadata,
    handler: Arc<dyn ActionHandler>,
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl ToolHandle {
    /// Returns the associated metadata.
    #[must_use]
    pub fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }
}

#[async_trait]
impl ActionHandler for ToolHandle {
    async fn invoke(&self, call: &ProposedToolCall) -> ToolResult<Value> {
        self.handler.invoke(call).await
    }
}

/// Registry that stores action handlers keyed by tool name.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<HashMap<String, ToolHandle>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("tool registry poisoned");
        let names: Vec<_> = inner.keys().cloned().collect();
        f.debug_struct("ToolRegistry")
            .field("registered", &names)
            .finish()
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action handler.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::DuplicateTool`] if the name is already present.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn register_tool<H>(&self, metadata: ToolMetadata, handler: H) -> ToolResult<()>
    where
        H: ActionHandler + 'static,
    {
        self.register_shared(metadata, Arc::new(handler))
    }

    /// Registers an already shared action handler.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::DuplicateTool`] if the name is already present.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn register_shared(
        &self,
        metadata: ToolMetadata,
        handler: Arc<dyn ActionHandler>,
    ) -> ToolResult<()> {
        let mut inner = self.inner.write().expect("tool registry poisoned");
        let name = metadata.name().to_owned();
        if inner.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }

        inner.insert(name, ToolHandle { metadata, handler });
        Ok(())
    }

    /// Returns a handle to the tool matching the supplied name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ToolHandle> {
        let inner = self.inner.read().ok()?;
        inner.get(name).cloned()
    }

    /// Returns true when a tool with the supplied name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .is_ok_and(|inner| inner.contains_key(name))
    }

    /// Invokes the tool named by the call directly, bypassing governance.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::UnknownTool`] when the tool is not found or
    /// propagates [`ToolError::Execution`] when the handler fails.
    pub async fn invoke(&self, call: &ProposedToolCall) -> ToolResult<Value> {
        let handle = self.get(call.tool()).ok_or_else(|| ToolError::UnknownTool {
            name: call.tool().to_owned(),
        })?;
        handle.invoke(call).await
    }

    /// Lists the metadata of all registered tools, sorted by name.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn list(&self) -> Vec<ToolMetadata> {
        let inner = self.inner.read().expect("tool registry poisoned");
        let mut tools: Vec<_> = inner
            .values()
            .map(|handle| handle.metadata.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

/// Errors produced by tool registration and invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// Tool metadata failed validation.
    #[error("invalid tool metadata: {reason}")]
    InvalidMetadata {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Tool name collided with an existing registration.
    #[error("tool `{name}` is already registered")]
    DuplicateTool {
        /// Name of the offending tool.
        name: String,
    },

    /// Requested tool does not exist.
    #[error("tool `{name}` is not registered")]
    UnknownTool {
        /// Name of the missing tool.
        name: String,
    },

    /// Tool execution failed.
    #[error("tool execution failed: {reason}")]
    Execution {
        /// Human-readable error returned by the tool implementation.
        reason: String,
    },
}

impl ToolError {
    /// Creates an execution error from the supplied reason.
    #[must_use]
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution {
            reason: reason.into(),
        }
    }
}
