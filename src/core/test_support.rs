//! Broker wrapper with injectable failures, shared by the engine tests.

use crate::broker::{Broker, CancelationStream, InMemoryBroker};
use crate::error::{ErrorCode, ForgeError, ForgeResult};
use crate::task::{ServerInfo, TaskMessage, TaskState, WorkerInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, SystemTime};

/// Number of calls made to each broker operation.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallCounts {
    pub dequeue: usize,
    pub done: usize,
    pub requeue: usize,
    pub retry: usize,
    pub archive: usize,
    pub forward: usize,
    pub list_deadline_exceeded: usize,
    pub clear_server_state: usize,
}

#[derive(Debug, Default)]
struct Failures {
    done: usize,
    retry: usize,
    forward: usize,
    dequeue: usize,
}

/// [`InMemoryBroker`] that can be told to fail the next N calls of an
/// operation and can override the deadline handed out by `dequeue`.
#[derive(Debug, Default)]
pub(crate) struct FlakyBroker {
    inner: InMemoryBroker,
    failures: Mutex<Failures>,
    calls: Mutex<CallCounts>,
    deadline: Mutex<Option<Duration>>,
}

fn injected(op: &'static str) -> ForgeError {
    ForgeError::op(op, ErrorCode::Internal, "injected failure")
}

fn take_failure(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryBroker {
        &self.inner
    }

    pub fn calls(&self) -> CallCounts {
        self.calls.lock().clone()
    }

    pub fn fail_done(&self, n: usize) {
        self.failures.lock().done = n;
    }

    pub fn fail_retry(&self, n: usize) {
        self.failures.lock().retry = n;
    }

    pub fn fail_forward(&self, n: usize) {
        self.failures.lock().forward = n;
    }

    pub fn fail_dequeue(&self, n: usize) {
        self.failures.lock().dequeue = n;
    }

    /// Hand out deadlines `timeout` after dequeue instead of the message's.
    pub fn set_deadline(&self, timeout: Duration) {
        *self.deadline.lock() = Some(timeout);
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn ping(&self) -> ForgeResult<()> {
        self.inner.ping().await
    }

    async fn enqueue(&self, msg: &TaskMessage) -> ForgeResult<()> {
        self.inner.enqueue(msg).await
    }

    async fn enqueue_unique(&self, msg: &TaskMessage, ttl: Duration) -> ForgeResult<()> {
        self.inner.enqueue_unique(msg, ttl).await
    }

    async fn dequeue(&self, queues: &[String]) -> ForgeResult<(TaskMessage, SystemTime)> {
        self.calls.lock().dequeue += 1;
        if take_failure(&mut self.failures.lock().dequeue) {
            return Err(injected("flaky.dequeue"));
        }
        let (msg, deadline) = self.inner.dequeue(queues).await?;
        let deadline = match *self.deadline.lock() {
            Some(timeout) => SystemTime::now() + timeout,
            None => deadline,
        };
        Ok((msg, deadline))
    }

    async fn done(&self, msg: &TaskMessage) -> ForgeResult<()> {
        self.calls.lock().done += 1;
        if take_failure(&mut self.failures.lock().done) {
            return Err(injected("flaky.done"));
        }
        self.inner.done(msg).await
    }

    async fn requeue(&self, msg: &TaskMessage) -> ForgeResult<()> {
        self.calls.lock().requeue += 1;
        self.inner.requeue(msg).await
    }

    async fn schedule(&self, msg: &TaskMessage, process_at: SystemTime) -> ForgeResult<()> {
        self.inner.schedule(msg, process_at).await
    }

    async fn schedule_unique(
        &self,
        msg: &TaskMessage,
        process_at: SystemTime,
        ttl: Duration,
    ) -> ForgeResult<()> {
        self.inner.schedule_unique(msg, process_at, ttl).await
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: SystemTime,
        err_msg: &str,
        is_failure: bool,
    ) -> ForgeResult<()> {
        self.calls.lock().retry += 1;
        if take_failure(&mut self.failures.lock().retry) {
            return Err(injected("flaky.retry"));
        }
        self.inner.retry(msg, process_at, err_msg, is_failure).await
    }

    async fn archive(&self, msg: &TaskMessage, err_msg: &str) -> ForgeResult<()> {
        self.calls.lock().archive += 1;
        self.inner.archive(msg, err_msg).await
    }

    async fn forward_if_ready(&self, queues: &[String]) -> ForgeResult<()> {
        self.calls.lock().forward += 1;
        if take_failure(&mut self.failures.lock().forward) {
            return Err(injected("flaky.forward"));
        }
        self.inner.forward_if_ready(queues).await
    }

    async fn list_deadline_exceeded(
        &self,
        deadline: SystemTime,
        queues: &[String],
    ) -> ForgeResult<Vec<TaskMessage>> {
        self.calls.lock().list_deadline_exceeded += 1;
        self.inner.list_deadline_exceeded(deadline, queues).await
    }

    async fn write_server_state(
        &self,
        info: &ServerInfo,
        workers: &[WorkerInfo],
        ttl: Duration,
    ) -> ForgeResult<()> {
        self.inner.write_server_state(info, workers, ttl).await
    }

    async fn clear_server_state(&self, host: &str, pid: u32, server_id: &str) -> ForgeResult<()> {
        self.calls.lock().clear_server_state += 1;
        self.inner.clear_server_state(host, pid, server_id).await
    }

    async fn cancelation_pubsub(&self) -> ForgeResult<CancelationStream> {
        self.inner.cancelation_pubsub().await
    }

    async fn publish_cancelation(&self, id: &str) -> ForgeResult<()> {
        self.inner.publish_cancelation(id).await
    }

    async fn close(&self) -> ForgeResult<()> {
        self.inner.close().await
    }
}

/// Pending message with a one-minute timeout and three retries.
pub(crate) fn message(id: &str, queue: &str) -> TaskMessage {
    TaskMessage {
        type_name: "test_task".to_string(),
        id: id.to_string(),
        name: None,
        queue: queue.to_string(),
        state: TaskState::Active,
        payload: Vec::new(),
        retry: 3,
        retried: 0,
        error_msg: None,
        timeout: 60,
        deadline: 0,
        unique_key: None,
        done_calls: Vec::new(),
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
