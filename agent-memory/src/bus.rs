//! Coordinates the volatile trace ring and the optional durable journal.

use std::fmt;
use std::sync::Arc;

use agent_primitives::CallId;

use crate::journal::Journal;
use crate::record::MemoryRecord;
use crate::volatile::{VolatileConfig, VolatileMemory, VolatileStats};
use crate::{MemoryError, MemoryResult};

/// Builder for [`MemoryBus`] instances.
pub struct MemoryBusBuilder {
    volatile_config: VolatileConfig,
    journal: Option<Arc<dyn Journal>>,
}

impl MemoryBusBuilder {
    /// Starts a new builder using the supplied volatile config.
    #[must_use]
    pub fn new(volatile_config: VolatileConfig) -> Self {
        Self {
            volatile_config,
            journal: None,
        }
    }

    /// Installs a durable journal.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Builds the [`MemoryBus`].
    #[must_use]
    pub fn build(self) -> MemoryBus {
        MemoryBus {
            volatile: Arc::new(VolatileMemory::new(self.volatile_config)),
            journal: self.journal,
        }
    }
}

/// Trace store used by the memory writer role.
#[derive(Clone)]
pub struct MemoryBus {
    volatile: Arc<VolatileMemory>,
    journal: Option<Arc<dyn Journal>>,
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus")
            .field("volatile", &self.volatile)
            .field("journal", &self.journal.is_some())
            .finish()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::builder(VolatileConfig::default()).build()
    }
}

impl MemoryBus {
    /// Creates a builder for a memory bus.
    #[must_use]
    pub fn builder(config: VolatileConfig) -> MemoryBusBuilder {
        MemoryBusBuilder::new(config)
    }

    /// Returns the underlying volatile store.
    #[must_use]
    pub fn volatile(&self) -> &Arc<VolatileMemory> {
        &self.volatile
    }

    /// Returns the configured journal, if present.
    #[must_use]
    pub fn journal(&self) -> Option<&Arc<dyn Journal>> {
        self.journal.as_ref()
    }

    /// Persists a record to the ring and, when configured, the journal.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] when writing to the journal fails. The record is
    /// still retained in volatile memory.
    pub async fn record(&self, record: MemoryRecord) -> MemoryResult<()> {
        self.volatile.push(record.clone()).await;
        if let Some(journal) = &self.journal {
            journal.append(&record).await?;
        }
        Ok(())
    }

    /// Returns recent records from volatile memory.
    #[must_use]
    pub async fn recent(&self, limit: usize) -> Vec<MemoryRecord> {
        self.volatile.recent(limit).await
    }

    /// Returns retained records for one call.
    #[must_use]
    pub async fn traces_for(&self, call_id: CallId) -> Vec<MemoryRecord> {
        self.volatile.for_call(call_id).await
    }

    /// Reads the tail of the journal.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::MissingJournal`] when no journal is configured,
    /// or propagates read and decode failures.
    pub async fn journal_tail(&self, limit: usize) -> MemoryResult<Vec<MemoryRecord>> {
        let journal = self.journal.as_ref().ok_or(MemoryError::MissingJournal)?;
        journal.tail(limit).await
    }

    /// Returns utilisation statistics for the volatile store.
    #[must_use]
    pub async fn stats(&self) -> VolatileStats {
        self.volatile.stats().await
    }
}
