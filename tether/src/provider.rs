//! Injected time and task-scheduling capabilities.
//!
//! The buffered channels never spawn onto a hard-coded runtime or read the
//! wall clock directly: both capabilities are injected through these traits
//! so deployments control scheduling and tests control time.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
///
/// `now()` is monotonic elapsed time since provider creation; the buffered
/// channels only ever compare differences, never absolute timestamps.
#[async_trait]
pub trait TimeProvider: Clone + Send + Sync {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Monotonic elapsed time since provider creation.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: Future<Output = T> + Send;
}

/// Provider for submitting short-lived background tasks.
///
/// This is the scheduler seam: the reconnect, sender, flusher and event
/// dispatch tasks all go through it, so deployments can route them onto a
/// shared worker pool.
pub trait TaskProvider: Clone + Send + Sync {
    /// Submit a named task for execution.
    fn spawn_task<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Bundle of providers for a runtime environment.
///
/// Consolidates the two provider types into a single type parameter so
/// downstream signatures stay small.
pub trait Providers: Clone + Send + Sync + 'static {
    /// Time provider type for sleep, timeout, and time queries.
    type Time: TimeProvider + 'static;

    /// Task provider type for spawning background tasks.
    type Task: TaskProvider + 'static;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;
}

/// Real time provider using Tokio's time facilities.
///
/// Measures time with [`tokio::time::Instant`], so tests running under a
/// paused Tokio clock observe deterministic time.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: Future<Output = T> + Send,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeError::Elapsed)
    }
}

/// Task provider backed by `tokio::spawn`.
#[derive(Debug, Clone, Copy)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!("spawning task: {}", name);
        tokio::spawn(future)
    }
}

/// Production providers using the Tokio runtime.
#[derive(Clone)]
pub struct TokioProviders {
    time: TokioTimeProvider,
    task: TokioTaskProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self {
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
        }
    }
}

impl Default for TokioProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl Providers for TokioProviders {
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}
