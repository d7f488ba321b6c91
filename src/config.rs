//! Configuration types for taskforge.
//!
//! This module contains the configuration structures used by the engine:
//! worker pool settings, queue priorities, component intervals, the default
//! retry policy and logging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration for a taskforge engine.
///
/// # Examples
///
/// ```rust
/// use taskforge::config::{ForgeConfig, WorkerConfig};
///
/// let config = ForgeConfig {
///     workers: WorkerConfig::with_concurrency(8).with_shutdown_timeout(30),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForgeConfig {
    /// Worker pool configuration
    pub workers: WorkerConfig,

    /// Queue names and priorities
    pub queues: QueueConfig,

    /// Background component configuration
    pub engine: EngineConfig,

    /// Default retry policy
    pub retry: RetryPolicy,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of handlers executing at once
    pub concurrency: usize,

    /// Grace period given to in-flight handlers on shutdown (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Sleep between dequeue attempts when every queue is empty (in milliseconds)
    pub poll_backoff_ms: u64,

    /// Timeout applied to tasks enqueued without timeout or deadline (in seconds)
    pub default_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            shutdown_timeout_secs: 8,
            poll_backoff_ms: 1000,
            default_timeout_secs: 1800, // 30 minutes
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration with a specific concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }

    /// Set the empty-queue poll backoff.
    pub fn with_poll_backoff(mut self, backoff_ms: u64) -> Self {
        self.poll_backoff_ms = backoff_ms;
        self
    }

    /// Set the default task timeout.
    pub fn with_default_timeout(mut self, timeout_secs: u64) -> Self {
        self.default_timeout_secs = timeout_secs;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }
}

/// Queue configuration: queue name to priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue priorities; higher is polled first
    pub queues: HashMap<String, u32>,

    /// Queue used by producers when none is given
    pub default_queue: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queues: HashMap::from([("default".to_string(), 1)]),
            default_queue: "default".to_string(),
        }
    }
}

impl QueueConfig {
    /// Create a configuration from `(name, priority)` pairs.
    ///
    /// The first queue becomes the default queue.
    pub fn with_queues<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let pairs: Vec<(String, u32)> = queues.into_iter().map(|(q, p)| (q.into(), p)).collect();
        let default_queue = pairs
            .first()
            .map(|(q, _)| q.clone())
            .unwrap_or_else(|| "default".to_string());
        Self {
            queues: pairs.into_iter().collect(),
            default_queue,
        }
    }

    /// Queue names in polling order: descending priority, ties broken by name.
    pub fn resolved_queues(&self) -> Vec<String> {
        let mut entries: Vec<(&String, &u32)> = self.queues.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().map(|(q, _)| q.clone()).collect()
    }
}

/// Intervals and identity of the background components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry interval of the state syncer (in milliseconds)
    pub sync_interval_ms: u64,

    /// Interval between promotions of due scheduled tasks (in milliseconds)
    pub forward_interval_ms: u64,

    /// Interval between scans for tasks stuck past their deadline (in milliseconds)
    pub recover_interval_ms: u64,

    /// Interval between server state writes (in milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Host name reported in server telemetry
    pub host: String,

    /// Server identifier reported in telemetry
    pub server_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5000,
            forward_interval_ms: 5000,
            recover_interval_ms: 60_000,
            heartbeat_interval_ms: 5000,
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            server_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Retry policy used to compute the delay before a failed task runs again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries for tasks enqueued without an explicit value
    pub max_retry: u32,

    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 25,
            base_delay_ms: 1000,     // 1 second
            max_delay_ms: 3_600_000, // 1 hour
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with the given retry limit.
    pub fn exponential(max_retry: u32) -> Self {
        Self {
            max_retry,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            ..Default::default()
        }
    }

    /// Fixed delay between retries.
    pub fn fixed(max_retry: u32, delay_ms: u64) -> Self {
        Self {
            max_retry,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retry: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retried + 1`.
    pub fn delay(&self, retried: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let millis = match &self.backoff_strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear { increment_ms } => {
                base + (*increment_ms as f64) * retried as f64
            }
            BackoffStrategy::Exponential { multiplier } => {
                base * multiplier.powi(retried.min(63) as i32)
            }
        };
        Duration::from_millis(millis.min(self.max_delay_ms as f64).max(0.0) as u64)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + attempt * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Exponential backoff (base * multiplier^attempt)
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber for this configuration.
    ///
    /// Returns `false` if a subscriber was already installed.
    pub fn init(&self) -> bool {
        let level: tracing::Level = self.level.clone().into();
        let builder = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(self.include_targets);

        if self.json_format {
            builder.json().try_init().is_ok()
        } else {
            builder.with_ansi(self.colored).try_init().is_ok()
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl ForgeConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                concurrency: 2,
                shutdown_timeout_secs: 3,
                ..Default::default()
            },
            engine: EngineConfig {
                forward_interval_ms: 1000,
                heartbeat_interval_ms: 2000,
                ..Default::default()
            },
            retry: RetryPolicy::fixed(3, 1000),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            workers: WorkerConfig {
                concurrency: num_cpus::get() * 2,
                shutdown_timeout_secs: 30,
                ..Default::default()
            },
            retry: RetryPolicy::exponential(25),
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing: tiny intervals, one worker.
    pub fn testing() -> Self {
        Self {
            workers: WorkerConfig {
                concurrency: 1,
                shutdown_timeout_secs: 1,
                poll_backoff_ms: 10,
                default_timeout_secs: 10,
            },
            engine: EngineConfig {
                sync_interval_ms: 50,
                forward_interval_ms: 50,
                recover_interval_ms: 100,
                heartbeat_interval_ms: 50,
                ..Default::default()
            },
            retry: RetryPolicy::fixed(1, 100),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers.concurrency == 0 {
            errors.push("Concurrency must be greater than 0".to_string());
        }

        if self.workers.concurrency > u32::MAX as usize {
            errors.push("Concurrency must fit in a u32".to_string());
        }

        if self.queues.queues.is_empty() {
            errors.push("At least one queue must be configured".to_string());
        }

        if self.queues.queues.keys().any(|q| q.trim().is_empty()) {
            errors.push("Queue names must not be empty".to_string());
        }

        if self.queues.queues.values().any(|p| *p == 0) {
            errors.push("Queue priority must be greater than 0".to_string());
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        let intervals = [
            ("Sync", self.engine.sync_interval_ms),
            ("Forward", self.engine.forward_interval_ms),
            ("Recover", self.engine.recover_interval_ms),
            ("Heartbeat", self.engine.heartbeat_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                errors.push(format!("{name} interval must be greater than 0"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
