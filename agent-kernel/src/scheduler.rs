//! Bounded scheduler for independent governed requests.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agent_config::{ConfigError, SchedulerSection};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_MAX_CONCURRENCY: NonZeroUsize = NonZeroUsize::MIN.saturating_add(31);

/// Maximum number of requests governed concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    max_concurrency: NonZeroUsize,
}

impl SchedulerConfig {
    /// Creates a new configuration with the supplied concurrency limit.
    #[must_use]
    pub const fn new(max_concurrency: NonZeroUsize) -> Self {
        Self { max_concurrency }
    }

    /// Converts the configuration file section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the limit is zero.
    pub fn from_section(section: &SchedulerSection) -> Result<Self, ConfigError> {
        NonZeroUsize::new(section.max_concurrency)
            .map(Self::new)
            .ok_or_else(|| {
                ConfigError::Invalid("scheduler.max_concurrency must be greater than zero".into())
            })
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub const fn max_concurrency(self) -> NonZeroUsize {
        self.max_concurrency
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

/// Wrapper around `tokio::spawn` that bounds how many tasks run at once.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    /// Constructs a scheduler using the provided configuration.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let permits = config.max_concurrency().get();
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            closed: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Returns the associated configuration.
    #[must_use]
    pub const fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Returns `true` if the scheduler has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the scheduler. Queued tasks that have not started resolve to
    /// [`SchedulerError::Closed`]; running tasks finish normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    /// Spawns a future once a concurrency permit is available.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] when the scheduler is closed before
    /// the task is enqueued. The task itself yields the same error when the
    /// scheduler closes while it waits for a permit.
    pub fn spawn<F, T>(&self, future: F) -> SchedulerResult<JoinHandle<SchedulerResult<T>>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let semaphore = Arc::clone(&self.semaphore);
        debug!(
            available = semaphore.available_permits(),
            "scheduling governed task"
        );

        Ok(tokio::spawn(async move {
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| SchedulerError::Closed)?;
            let output = future.await;
            drop(permit);
            Ok(output)
        }))
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Errors produced by the scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Scheduler is closed and will not accept new tasks.
    #[error("scheduler closed")]
    Closed,
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
