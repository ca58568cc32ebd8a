//! Verification-gated trace persistence.

use std::sync::Arc;

use agent_config::MemorySection;
use agent_memory::{FileJournal, MemoryBus, MemoryChannel, MemoryRecord, MemoryResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::KernelResult;
use crate::pipeline::PipelineResult;

/// Trace offered to a memory writer.
#[derive(Debug, Clone, Copy)]
pub struct MemoryWriteRequest<'a> {
    /// Result of the governed call.
    pub trace: &'a PipelineResult,
    /// Orchestrator request the call belonged to.
    pub request_id: Option<Uuid>,
}

impl<'a> MemoryWriteRequest<'a> {
    /// Wraps a pipeline result.
    #[must_use]
    pub fn new(trace: &'a PipelineResult) -> Self {
        Self {
            trace,
            request_id: None,
        }
    }

    /// Links the write to an orchestrator request.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// What a memory writer did with a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryWriteReport {
    /// Whether a record was stored.
    pub written: bool,
    /// Identifier of the stored record.
    pub record_id: Option<Uuid>,
    /// Why nothing was stored.
    pub reason: Option<String>,
}

impl MemoryWriteReport {
    fn written(record_id: Uuid) -> Self {
        Self {
            written: true,
            record_id: Some(record_id),
            reason: None,
        }
    }

    pub(crate) fn skipped(reason: impl Into<String>) -> Self {
        Self {
            written: false,
            record_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// Persists traces behind the verification gate.
#[async_trait]
pub trait MemoryWriterRole: Send + Sync {
    /// Stores the trace when the gate permits it.
    async fn write(&self, request: MemoryWriteRequest<'_>) -> MemoryWriteReport;
}

/// Writer that stores only verified traces on the `trace` channel.
#[derive(Debug, Clone, Default)]
pub struct GatedMemoryWriter {
    bus: MemoryBus,
}

impl GatedMemoryWriter {
    /// Creates a writer over the supplied bus.
    #[must_use]
    pub fn new(bus: MemoryBus) -> Self {
        Self { bus }
    }

    /// Builds the bus described by the configuration, opening the journal
    /// when a path is set.
    ///
    /// # Errors
    ///
    /// Returns an error when the ring capacity is invalid or the journal
    /// cannot be opened.
    pub async fn from_section(section: &MemorySection) -> KernelResult<Self> {
        let mut builder = MemoryBus::builder(section.volatile_config()?);
        if let Some(path) = &section.journal_path {
            builder = builder.with_journal(Arc::new(FileJournal::open(path.clone()).await?));
        }
        Ok(Self::new(builder.build()))
    }

    /// Returns the underlying bus.
    #[must_use]
    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    fn record_for(request: &MemoryWriteRequest<'_>) -> MemoryResult<MemoryRecord> {
        let trace = request.trace;
        let payload = serde_json::to_value(trace).unwrap_or_else(|err| {
            json!({ "outcome": trace.outcome.as_str(), "encode_error": err.to_string() })
        });
        let mut builder = MemoryRecord::builder(MemoryChannel::Trace, payload)
            .call(trace.call_id, trace.tool.clone())
            .tags([
                format!("tool:{}", trace.tool),
                format!("outcome:{}", trace.outcome),
            ])?;
        if let Some(request_id) = request.request_id {
            builder = builder.metadata("request_id", json!(request_id));
        }
        builder.build()
    }
}

#[async_trait]
impl MemoryWriterRole for GatedMemoryWriter {
    async fn write(&self, request: MemoryWriteRequest<'_>) -> MemoryWriteReport {
        let trace = request.trace;
        if !trace.verification_passed() {
            debug!(call_id = %trace.call_id, outcome = %trace.outcome, "trace not verified, skipping write");
            return MemoryWriteReport::skipped("verification did not pass");
        }

        let record = match Self::record_for(&request) {
            Ok(record) => record,
            Err(err) => {
                warn!(call_id = %trace.call_id, error = %err, "could not build trace record");
                return MemoryWriteReport::skipped(err.to_string());
            }
        };
        let record_id = record.id();
        match self.bus.record(record).await {
            Ok(()) => MemoryWriteReport::written(record_id),
            Err(err) => {
                warn!(call_id = %trace.call_id, error = %err, "trace journal write failed");
                MemoryWriteReport {
                    written: true,
                    record_id: Some(record_id),
                    reason: Some(format!("volatile only: {err}")),
                }
            }
        }
    }
}
