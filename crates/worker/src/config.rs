use std::time::Duration;

/// Default number of concurrent worker tasks.
const DEFAULT_WORKER_COUNT: usize = 4;

/// Default capacity of the in-memory work queue.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default per-subscriber progress buffer.
const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Default grace period for in-flight jobs on shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Configuration for the job worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of jobs allowed in `RUNNING` at the same time.
    pub worker_count: usize,
    /// Jobs waiting for a free worker before `enqueue` starts to wait.
    pub queue_capacity: usize,
    /// Progress events buffered per subscriber before new ones are dropped.
    pub subscriber_buffer: usize,
    /// How long `shutdown` lets in-flight jobs finish before cancelling them.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_COUNT` | `4` | Concurrent worker tasks |
    /// | `JOB_QUEUE_CAPACITY` | `256` | Work queue capacity |
    /// | `JOB_SUBSCRIBER_BUFFER` | `64` | Progress events buffered per subscriber |
    /// | `JOB_SHUTDOWN_TIMEOUT_SECS` | `30` | Grace period for running jobs on shutdown |
    pub fn from_env() -> Self {
        let worker_count = env_parse("JOB_WORKER_COUNT").unwrap_or(DEFAULT_WORKER_COUNT);
        let queue_capacity = env_parse("JOB_QUEUE_CAPACITY").unwrap_or(DEFAULT_QUEUE_CAPACITY);
        let subscriber_buffer =
            env_parse("JOB_SUBSCRIBER_BUFFER").unwrap_or(DEFAULT_SUBSCRIBER_BUFFER);
        let shutdown_timeout_secs =
            env_parse("JOB_SHUTDOWN_TIMEOUT_SECS").unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        Self::default()
            .with_worker_count(worker_count)
            .with_queue_capacity(queue_capacity)
            .with_subscriber_buffer(subscriber_buffer)
            .with_shutdown_timeout(Duration::from_secs(shutdown_timeout_secs))
    }

    /// Set the worker count (at least one).
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the work queue capacity (at least one).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.subscriber_buffer, 64);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn builders_enforce_minimums() {
        let config = WorkerConfig::default()
            .with_worker_count(0)
            .with_queue_capacity(0)
            .with_subscriber_buffer(0);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.subscriber_buffer, 1);
    }
}
