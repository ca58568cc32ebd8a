//! Trace storage for governed tool calls.
//!
//! Records land in a bounded [`VolatileMemory`] ring and, when configured, an
//! append-only NDJSON [`FileJournal`]. The [`MemoryBus`] fronts both.

#![warn(missing_docs, clippy::pedantic)]

pub mod bus;
mod error;
pub mod journal;
pub mod record;
pub mod volatile;

pub use bus::{MemoryBus, MemoryBusBuilder};
pub use error::{MemoryError, MemoryResult};
pub use journal::{FileJournal, Journal};
pub use record::{MemoryChannel, MemoryRecord, MemoryRecordBuilder};
pub use volatile::{VolatileConfig, VolatileMemory, VolatileStats};
