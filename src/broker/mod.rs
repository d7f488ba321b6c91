//! Durable store and transport used by the engine.
//!
//! The engine never changes a task's placement itself: every transition
//! (dequeue, done, retry, archive, requeue, forward) is a [`Broker`] call.
//! A broker implementation is responsible for making each call atomic.
//!
//! Two conditions are signalled with dedicated errors:
//! - [`ForgeError::NoProcessableTask`](crate::error::ForgeError::NoProcessableTask)
//!   from [`Broker::dequeue`] when every queue is empty;
//! - [`ForgeError::DuplicateTask`](crate::error::ForgeError::DuplicateTask)
//!   from the unique enqueue/schedule variants while the key is locked.
//!
//! [`InMemoryBroker`] is a process-local implementation for development and
//! tests.

use crate::error::ForgeResult;
use crate::task::{ServerInfo, TaskMessage, WorkerInfo};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::{Duration, SystemTime};

pub mod memory;
pub use memory::{InMemoryBroker, QueueStats};

/// Stream of task IDs whose cancellation was requested.
pub type CancelationStream = BoxStream<'static, String>;

/// Trait that all store backends must implement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> ForgeResult<()>;

    /// Add a message to the pending queue of `msg.queue`.
    async fn enqueue(&self, msg: &TaskMessage) -> ForgeResult<()>;

    /// Like [`Broker::enqueue`] but fails with `DuplicateTask` while another
    /// task holds `msg.unique_key`. The lock expires after `ttl`.
    async fn enqueue_unique(&self, msg: &TaskMessage, ttl: Duration) -> ForgeResult<()>;

    /// Take one pending message from the first non-empty queue in `queues`
    /// and mark it as executing. Returns the message and its deadline.
    async fn dequeue(&self, queues: &[String]) -> ForgeResult<(TaskMessage, SystemTime)>;

    /// Remove an executing message after success, releasing its uniqueness
    /// lock and enqueueing its done-call chain.
    async fn done(&self, msg: &TaskMessage) -> ForgeResult<()>;

    /// Move an executing message back to pending.
    async fn requeue(&self, msg: &TaskMessage) -> ForgeResult<()>;

    /// Store a message to be processed at `process_at`.
    async fn schedule(&self, msg: &TaskMessage, process_at: SystemTime) -> ForgeResult<()>;

    /// Unique variant of [`Broker::schedule`].
    async fn schedule_unique(
        &self,
        msg: &TaskMessage,
        process_at: SystemTime,
        ttl: Duration,
    ) -> ForgeResult<()>;

    /// Move an executing message to the retry set. `is_failure` tells whether
    /// the attempt counts toward the retry limit.
    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: SystemTime,
        err_msg: &str,
        is_failure: bool,
    ) -> ForgeResult<()>;

    /// Move an executing message to the archive.
    async fn archive(&self, msg: &TaskMessage, err_msg: &str) -> ForgeResult<()>;

    /// Move due scheduled and retry messages of `queues` to pending.
    async fn forward_if_ready(&self, queues: &[String]) -> ForgeResult<()>;

    /// Executing messages whose deadline is before `deadline`.
    async fn list_deadline_exceeded(
        &self,
        deadline: SystemTime,
        queues: &[String],
    ) -> ForgeResult<Vec<TaskMessage>>;

    /// Write a server telemetry snapshot that expires after `ttl`.
    async fn write_server_state(
        &self,
        info: &ServerInfo,
        workers: &[WorkerInfo],
        ttl: Duration,
    ) -> ForgeResult<()>;

    /// Remove the telemetry of a server.
    async fn clear_server_state(&self, host: &str, pid: u32, server_id: &str) -> ForgeResult<()>;

    /// Subscribe to cancellation broadcasts.
    async fn cancelation_pubsub(&self) -> ForgeResult<CancelationStream>;

    /// Broadcast a cancellation request for task `id`.
    async fn publish_cancelation(&self, id: &str) -> ForgeResult<()>;

    /// Release the store connection.
    async fn close(&self) -> ForgeResult<()>;
}
