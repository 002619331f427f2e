//! Configuration for the buffered channel wrappers.

use std::time::Duration;

/// Buffering and reconnection policy shared by both buffered channels.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// How long a channel may stay disconnected before it is declared
    /// permanently closed (output side) or a receiver identity is declared
    /// permanently disconnected (input side).
    pub max_offline_time: Duration,

    /// Pause between reconnection attempts and between send retries.
    pub retry_interval: Duration,

    /// Bound on how long shutdown waits for a background task to stop.
    pub shutdown_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_offline_time: Duration::from_secs(10),
            retry_interval: Duration::from_millis(300),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl BufferConfig {
    /// Configuration with the given offline tolerance and default policy
    /// intervals.
    pub fn new(max_offline_time: Duration) -> Self {
        Self {
            max_offline_time,
            ..Self::default()
        }
    }

    /// Override the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Override the shutdown wait bound.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
