//! In-memory trace ring retaining the most recent records.

use std::collections::VecDeque;
use std::num::NonZeroUsize;

use agent_primitives::CallId;
use tokio::sync::RwLock;

use crate::record::{MemoryChannel, MemoryRecord};
use crate::{MemoryError, MemoryResult};

const DEFAULT_CAPACITY: usize = 256;

/// Configuration for the volatile ring.
#[derive(Debug, Clone, Copy)]
pub struct VolatileConfig {
    capacity: NonZeroUsize,
}

impl VolatileConfig {
    /// Creates a configuration with the provided capacity.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { capacity }
    }

    /// Creates a configuration from a raw capacity.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] when `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> MemoryResult<Self> {
        NonZeroUsize::new(capacity)
            .map(Self::new)
            .ok_or(MemoryError::InvalidConfig("volatile capacity must be non-zero"))
    }

    /// Returns the configured capacity.
    #[must_use]
    pub const fn capacity(self) -> NonZeroUsize {
        self.capacity
    }
}

impl Default for VolatileConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// Bounded ring of recent trace records.
#[derive(Debug)]
pub struct VolatileMemory {
    config: VolatileConfig,
    entries: RwLock<VecDeque<MemoryRecord>>,
}

impl VolatileMemory {
    /// Creates a new ring using the supplied configuration.
    #[must_use]
    pub fn new(config: VolatileConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(VecDeque::with_capacity(config.capacity().get())),
        }
    }

    /// Inserts a record, evicting the oldest entry once capacity is reached.
    pub async fn push(&self, record: MemoryRecord) {
        let mut guard = self.entries.write().await;
        if guard.len() == self.config.capacity().get() {
            guard.pop_front();
        }
        guard.push_back(record);
    }

    /// Returns the most recent records up to the requested limit, oldest first.
    #[must_use]
    pub async fn recent(&self, limit: usize) -> Vec<MemoryRecord> {
        let guard = self.entries.read().await;
        let skip = guard.len().saturating_sub(limit);
        guard.iter().skip(skip).cloned().collect()
    }

    /// Returns every retained record for the supplied call, oldest first.
    #[must_use]
    pub async fn for_call(&self, call_id: CallId) -> Vec<MemoryRecord> {
        let guard = self.entries.read().await;
        guard
            .iter()
            .filter(|record| record.call_id() == Some(call_id))
            .cloned()
            .collect()
    }

    /// Returns every retained record on the supplied channel, oldest first.
    #[must_use]
    pub async fn on_channel(&self, channel: &MemoryChannel) -> Vec<MemoryRecord> {
        let guard = self.entries.read().await;
        guard
            .iter()
            .filter(|record| record.channel() == channel)
            .cloned()
            .collect()
    }

    /// Drops every retained record.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Returns statistics about the ring utilisation.
    #[must_use]
    pub async fn stats(&self) -> VolatileStats {
        let guard = self.entries.read().await;
        VolatileStats {
            entries: guard.len(),
            capacity: self.config.capacity().get(),
        }
    }
}

/// Snapshot describing utilisation of the volatile ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatileStats {
    /// Entries currently stored in the ring.
    pub entries: usize,
    /// Maximum number of entries permitted.
    pub capacity: usize,
}
