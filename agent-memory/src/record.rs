//! Trace records kept by the memory subsystem.

use agent_primitives::CallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{MemoryError, MemoryResult};

/// Channel categorising a memory entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryChannel {
    /// Verified tool-call traces written by the memory writer.
    Trace,
    /// Audit findings and safe-mode events.
    Audit,
    /// Internal kernel events.
    System,
    /// Custom channel tagged by implementers for domain-specific routing.
    Custom(String),
}

impl MemoryChannel {
    /// Creates a [`MemoryChannel::Custom`] value after validating the provided name.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] when the supplied label is empty.
    pub fn custom(label: impl Into<String>) -> MemoryResult<Self> {
        let value = label.into();
        if value.trim().is_empty() {
            return Err(MemoryError::InvalidRecord(
                "custom memory channel label must not be empty",
            ));
        }
        Ok(Self::Custom(value))
    }
}

/// A single captured trace entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    id: Uuid,
    recorded_at: DateTime<Utc>,
    channel: MemoryChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call_id: Option<CallId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
}

impl MemoryRecord {
    /// Creates a builder for a new memory record.
    #[must_use]
    pub fn builder(channel: MemoryChannel, payload: Value) -> MemoryRecordBuilder {
        MemoryRecordBuilder {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            channel,
            call_id: None,
            tool: None,
            payload,
            tags: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Returns the unique identifier for this record.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns when the record was captured.
    #[must_use]
    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    /// Returns the channel.
    #[must_use]
    pub fn channel(&self) -> &MemoryChannel {
        &self.channel
    }

    /// Returns the call the record belongs to, if any.
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        self.call_id
    }

    /// Returns the tool the record describes, if any.
    #[must_use]
    pub fn tool(&self) -> Option<&str> {
        self.tool.as_deref()
    }

    /// Returns the structured payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns associated tags.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Returns metadata map.
    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

/// Builder type used to assemble [`MemoryRecord`] instances safely.
#[derive(Debug)]
pub struct MemoryRecordBuilder {
    id: Uuid,
    recorded_at: DateTime<Utc>,
    channel: MemoryChannel,
    call_id: Option<CallId>,
    tool: Option<String>,
    payload: Value,
    tags: Vec<String>,
    metadata: Map<String, Value>,
}

impl MemoryRecordBuilder {
    /// Overrides the record identifier.
    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Overrides the capture timestamp.
    #[must_use]
    pub fn recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    /// Associates the record with a governed call.
    #[must_use]
    pub fn call(mut self, call_id: CallId, tool: impl Into<String>) -> Self {
        self.call_id = Some(call_id);
        self.tool = Some(tool.into());
        self
    }

    /// Adds a single tag after validating that it is not empty.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] when the tag is empty or whitespace.
    pub fn tag(mut self, tag: impl Into<String>) -> MemoryResult<Self> {
        let value = tag.into();
        if value.trim().is_empty() {
            return Err(MemoryError::InvalidRecord("memory tags must not be empty"));
        }
        self.tags.push(value);
        Ok(self)
    }

    /// Extends the record with multiple tags.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] if any supplied tag is empty.
    pub fn tags<I, S>(mut self, tags: I) -> MemoryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self = self.tag(tag)?;
        }
        Ok(self)
    }

    /// Adds metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Finalises the builder and produces the record.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidRecord`] when a tool name was attached
    /// but is empty.
    pub fn build(self) -> MemoryResult<MemoryRecord> {
        if self.tool.as_deref().is_some_and(|tool| tool.trim().is_empty()) {
            return Err(MemoryError::InvalidRecord("record tool name must not be empty"));
        }
        Ok(MemoryRecord {
            id: self.id,
            recorded_at: self.recorded_at,
            channel: self.channel,
            call_id: self.call_id,
            tool: self.tool,
            payload: self.payload,
            tags: self.tags,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_rejects_empty_tags() {
        let err = MemoryRecord::builder(MemoryChannel::Trace, Value::Null)
            .tag("")
            .expect_err("empty tag should fail");
        assert!(matches!(err, MemoryError::InvalidRecord(_)));

        let err = MemoryRecord::builder(MemoryChannel::Trace, Value::Null)
            .tags(["ok", " "])
            .expect_err("whitespace tag should fail");
        assert!(matches!(err, MemoryError::InvalidRecord(_)));
    }

    #[test]
    fn builder_attaches_call() {
        let call_id = CallId::random();
        let record = MemoryRecord::builder(MemoryChannel::Trace, json!({ "outcome": "completed" }))
            .call(call_id, "media.generate")
            .tag("outcome:completed")
            .unwrap()
            .metadata("risk", Value::from("high"))
            .build()
            .unwrap();

        assert_eq!(record.call_id(), Some(call_id));
        assert_eq!(record.tool(), Some("media.generate"));
        assert_eq!(record.payload()["outcome"], "completed");
        assert_eq!(record.metadata().get("risk").unwrap(), "high");
    }

    #[test]
    fn empty_tool_is_rejected() {
        let err = MemoryRecord::builder(MemoryChannel::Trace, Value::Null)
            .call(CallId::random(), " ")
            .build()
            .expect_err("empty tool");
        assert!(matches!(err, MemoryError::InvalidRecord(_)));
    }

    #[test]
    fn custom_channel_requires_label() {
        assert!(MemoryChannel::custom("").is_err());
        assert_eq!(
            MemoryChannel::custom("drift").unwrap(),
            MemoryChannel::Custom("drift".into())
        );
    }
}
