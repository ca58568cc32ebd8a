//! Durable trace journal implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use crate::record::MemoryRecord;
use crate::{MemoryError, MemoryResult};

/// Trait implemented by durable journals.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Appends a record to the journal.
    async fn append(&self, record: &MemoryRecord) -> MemoryResult<()>;

    /// Returns the most recent `limit` records, ordered oldest to newest.
    async fn tail(&self, limit: usize) -> MemoryResult<Vec<MemoryRecord>>;

    /// Clears the journal contents.
    async fn clear(&self) -> MemoryResult<()>;
}

/// File-backed journal writing newline-delimited JSON entries.
///
/// Each record is written with a single `write_all` call. A torn final line
/// left behind by a crash is skipped on read; corruption anywhere else is an
/// error.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileJournal {
    /// Opens (or creates) a journal file at the provided path.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors encountered while preparing the file.
    pub async fn open(path: impl Into<PathBuf>) -> MemoryResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Returns the underlying path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn decode(data: &str) -> MemoryResult<Vec<MemoryRecord>> {
    let lines: Vec<&str> = data.lines().filter(|line| !line.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<MemoryRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) if index + 1 == lines.len() && !data.ends_with('\n') => {
                warn!(error = %err, "skipping torn trailing journal entry");
            }
            Err(_) => return Err(MemoryError::CorruptJournal { line: index + 1 }),
        }
    }
    Ok(records)
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, record: &MemoryRecord) -> MemoryResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut guard = self.file.lock().await;
        guard.write_all(&line).await?;
        guard.flush().await?;
        Ok(())
    }

    async fn tail(&self, limit: usize) -> MemoryResult<Vec<MemoryRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.file.lock().await;
        let data = fs::read_to_string(&self.path).await?;
        let mut records = decode(&data)?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }

    async fn clear(&self) -> MemoryResult<()> {
        let mut guard = self.file.lock().await;
        guard.rewind().await?;
        guard.set_len(0).await?;
        guard.flush().await?;
        Ok(())
    }
}
