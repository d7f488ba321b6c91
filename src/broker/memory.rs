//! In-memory broker implementation.
//!
//! Stores every queue in process memory behind a single lock. Suitable for
//! development, tests and single-process deployments where tasks do not need
//! to survive a restart.

use super::{Broker, CancelationStream};
use crate::error::{ErrorCode, ForgeError, ForgeResult};
use crate::task::{ServerInfo, TaskId, TaskMessage, TaskState, WorkerInfo, time_after};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;

/// Deadline given to messages carrying neither timeout nor deadline.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Capacity of the cancellation broadcast channel.
const CANCEL_CHANNEL_CAPACITY: usize = 256;

/// Counts of the messages of one queue, by placement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Waiting to be dequeued
    pub pending: usize,
    /// Currently executing
    pub active: usize,
    /// Delayed by the producer
    pub scheduled: usize,
    /// Waiting for their next attempt
    pub retry: usize,
    /// Permanently failed
    pub archived: usize,
    /// Completed successfully since creation
    pub processed: u64,
    /// Failed attempts since creation
    pub failed: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TaskMessage>,
    active: HashMap<TaskId, (TaskMessage, SystemTime)>,
    scheduled: Vec<(SystemTime, TaskMessage)>,
    retry: Vec<(SystemTime, TaskMessage)>,
    archived: Vec<TaskMessage>,
    processed: u64,
    failed: u64,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id)
            || self.pending.iter().any(|m| m.id == id)
            || self.scheduled.iter().any(|(_, m)| m.id == id)
            || self.retry.iter().any(|(_, m)| m.id == id)
            || self.archived.iter().any(|m| m.id == id)
    }

    fn take_active(&mut self, op: &'static str, id: &str) -> ForgeResult<TaskMessage> {
        self.active
            .remove(id)
            .map(|(msg, _)| msg)
            .ok_or_else(|| ForgeError::op(op, ErrorCode::NotFound, format!("task {id} is not active")))
    }

    fn forward_due(&mut self, now: SystemTime) -> usize {
        let mut moved = 0;
        for set in [&mut self.scheduled, &mut self.retry] {
            let (due, later): (Vec<_>, Vec<_>) = set.drain(..).partition(|(at, _)| *at <= now);
            *set = later;
            for (_, mut msg) in due {
                msg.state = TaskState::Active;
                self.pending.push_back(msg);
                moved += 1;
            }
        }
        moved
    }
}

#[derive(Debug)]
struct ServerEntry {
    info: ServerInfo,
    workers: Vec<WorkerInfo>,
    expires_at: SystemTime,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    unique_locks: HashMap<String, (TaskId, SystemTime)>,
    servers: HashMap<String, ServerEntry>,
    closed: bool,
}

impl State {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn check_new(&mut self, op: &'static str, msg: &TaskMessage) -> ForgeResult<()> {
        if self.queue(&msg.queue).contains(&msg.id) {
            return Err(ForgeError::op(
                op,
                ErrorCode::AlreadyExists,
                format!("task ID {} already exists in queue {}", msg.id, msg.queue),
            ));
        }
        Ok(())
    }

    fn lock_unique(
        &mut self,
        op: &'static str,
        msg: &TaskMessage,
        ttl: Duration,
        now: SystemTime,
    ) -> ForgeResult<()> {
        let key = msg.unique_key.as_ref().ok_or_else(|| {
            ForgeError::op(op, ErrorCode::FailedPrecondition, "message has no unique key")
        })?;
        if let Some((_, expires_at)) = self.unique_locks.get(key) {
            if *expires_at > now {
                return Err(ForgeError::DuplicateTask);
            }
        }
        self.unique_locks
            .insert(key.clone(), (msg.id.clone(), time_after(now, ttl)));
        Ok(())
    }

    fn release_unique(&mut self, msg: &TaskMessage) {
        if let Some(key) = &msg.unique_key {
            if self
                .unique_locks
                .get(key)
                .is_some_and(|(holder, _)| *holder == msg.id)
            {
                self.unique_locks.remove(key);
            }
        }
    }

    fn push_pending(&mut self, msg: &TaskMessage) {
        let mut msg = msg.clone();
        msg.state = TaskState::Active;
        self.queue(&msg.queue.clone()).pending.push_back(msg);
    }

    fn push_scheduled(&mut self, msg: &TaskMessage, process_at: SystemTime) {
        let mut msg = msg.clone();
        msg.state = TaskState::Scheduled;
        self.queue(&msg.queue.clone())
            .scheduled
            .push((process_at, msg));
    }
}

fn server_key(host: &str, pid: u32, server_id: &str) -> String {
    format!("{host}:{pid}:{server_id}")
}

/// In-memory broker backend.
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    cancel_tx: broadcast::Sender<String>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (cancel_tx, _) = broadcast::channel(CANCEL_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            cancel_tx,
        }
    }

    /// Counts of the messages in `queue`.
    pub fn stats(&self, queue: &str) -> QueueStats {
        let state = self.state.lock();
        state
            .queues
            .get(queue)
            .map(|q| QueueStats {
                pending: q.pending.len(),
                active: q.active.len(),
                scheduled: q.scheduled.len(),
                retry: q.retry.len(),
                archived: q.archived.len(),
                processed: q.processed,
                failed: q.failed,
            })
            .unwrap_or_default()
    }

    /// Find a message of `queue` by ID in any placement.
    pub fn get_task(&self, queue: &str, id: &str) -> Option<TaskMessage> {
        let state = self.state.lock();
        let q = state.queues.get(queue)?;
        q.active
            .get(id)
            .map(|(m, _)| m)
            .or_else(|| q.pending.iter().find(|m| m.id == id))
            .or_else(|| q.scheduled.iter().map(|(_, m)| m).find(|m| m.id == id))
            .or_else(|| q.retry.iter().map(|(_, m)| m).find(|m| m.id == id))
            .or_else(|| q.archived.iter().find(|m| m.id == id))
            .cloned()
    }

    /// Archived messages of `queue`, oldest first.
    pub fn archived(&self, queue: &str) -> Vec<TaskMessage> {
        let state = self.state.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.archived.clone())
            .unwrap_or_default()
    }

    /// Messages of `queue` waiting for a retry, with their process time.
    pub fn retry_entries(&self, queue: &str) -> Vec<(SystemTime, TaskMessage)> {
        let state = self.state.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.retry.clone())
            .unwrap_or_default()
    }

    /// Telemetry of a server unless it expired.
    pub fn server_state(
        &self,
        host: &str,
        pid: u32,
        server_id: &str,
    ) -> Option<(ServerInfo, Vec<WorkerInfo>)> {
        let state = self.state.lock();
        state
            .servers
            .get(&server_key(host, pid, server_id))
            .filter(|e| e.expires_at > SystemTime::now())
            .map(|e| (e.info.clone(), e.workers.clone()))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self) -> ForgeResult<()> {
        if self.state.lock().closed {
            return Err(ForgeError::op(
                "memory.ping",
                ErrorCode::FailedPrecondition,
                "broker is closed",
            ));
        }
        Ok(())
    }

    async fn enqueue(&self, msg: &TaskMessage) -> ForgeResult<()> {
        let mut state = self.state.lock();
        state.check_new("memory.enqueue", msg)?;
        state.push_pending(msg);
        tracing::debug!(task_id = %msg.id, queue = %msg.queue, "Enqueued task");
        Ok(())
    }

    async fn enqueue_unique(&self, msg: &TaskMessage, ttl: Duration) -> ForgeResult<()> {
        let mut state = self.state.lock();
        state.check_new("memory.enqueue_unique", msg)?;
        state.lock_unique("memory.enqueue_unique", msg, ttl, SystemTime::now())?;
        state.push_pending(msg);
        Ok(())
    }

    async fn dequeue(&self, queues: &[String]) -> ForgeResult<(TaskMessage, SystemTime)> {
        let now = SystemTime::now();
        let mut state = self.state.lock();
        for name in queues {
            let Some(queue) = state.queues.get_mut(name) else {
                continue;
            };
            let Some(mut msg) = queue.pending.pop_front() else {
                continue;
            };
            msg.state = TaskState::Doing;
            let deadline = msg
                .effective_deadline(now)
                .unwrap_or(now + FALLBACK_TIMEOUT);
            queue
                .active
                .insert(msg.id.clone(), (msg.clone(), deadline));
            return Ok((msg, deadline));
        }
        Err(ForgeError::NoProcessableTask)
    }

    async fn done(&self, msg: &TaskMessage) -> ForgeResult<()> {
        let mut state = self.state.lock();
        let queue = state.queue(&msg.queue);
        let stored = queue.take_active("memory.done", &msg.id)?;
        queue.processed += 1;

        state.release_unique(&stored);
        for next in &stored.done_calls {
            state.push_pending(next);
        }
        Ok(())
    }

    async fn requeue(&self, msg: &TaskMessage) -> ForgeResult<()> {
        let mut state = self.state.lock();
        let queue = state.queue(&msg.queue);
        let mut stored = queue.take_active("memory.requeue", &msg.id)?;
        stored.state = TaskState::Active;
        queue.pending.push_front(stored);
        Ok(())
    }

    async fn schedule(&self, msg: &TaskMessage, process_at: SystemTime) -> ForgeResult<()> {
        let mut state = self.state.lock();
        state.check_new("memory.schedule", msg)?;
        state.push_scheduled(msg, process_at);
        Ok(())
    }

    async fn schedule_unique(
        &self,
        msg: &TaskMessage,
        process_at: SystemTime,
        ttl: Duration,
    ) -> ForgeResult<()> {
        let mut state = self.state.lock();
        state.check_new("memory.schedule_unique", msg)?;
        state.lock_unique("memory.schedule_unique", msg, ttl, SystemTime::now())?;
        state.push_scheduled(msg, process_at);
        Ok(())
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: SystemTime,
        err_msg: &str,
        is_failure: bool,
    ) -> ForgeResult<()> {
        let mut state = self.state.lock();
        let queue = state.queue(&msg.queue);
        let mut stored = queue.take_active("memory.retry", &msg.id)?;
        if is_failure {
            stored.retried += 1;
            queue.failed += 1;
        }
        stored.error_msg = Some(err_msg.to_string());
        stored.state = TaskState::Scheduled;
        queue.retry.push((process_at, stored));
        Ok(())
    }

    async fn archive(&self, msg: &TaskMessage, err_msg: &str) -> ForgeResult<()> {
        let mut state = self.state.lock();
        let queue = state.queue(&msg.queue);
        let mut stored = queue.take_active("memory.archive", &msg.id)?;
        stored.error_msg = Some(err_msg.to_string());
        stored.state = TaskState::Archived;
        queue.failed += 1;
        queue.archived.push(stored);
        Ok(())
    }

    async fn forward_if_ready(&self, queues: &[String]) -> ForgeResult<()> {
        let now = SystemTime::now();
        let mut state = self.state.lock();
        for name in queues {
            if let Some(queue) = state.queues.get_mut(name) {
                let moved = queue.forward_due(now);
                if moved > 0 {
                    tracing::debug!(queue = %name, count = moved, "Forwarded due tasks");
                }
            }
        }
        Ok(())
    }

    async fn list_deadline_exceeded(
        &self,
        deadline: SystemTime,
        queues: &[String],
    ) -> ForgeResult<Vec<TaskMessage>> {
        let state = self.state.lock();
        Ok(queues
            .iter()
            .filter_map(|name| state.queues.get(name))
            .flat_map(|q| q.active.values())
            .filter(|(_, task_deadline)| *task_deadline < deadline)
            .map(|(msg, _)| msg.clone())
            .collect())
    }

    async fn write_server_state(
        &self,
        info: &ServerInfo,
        workers: &[WorkerInfo],
        ttl: Duration,
    ) -> ForgeResult<()> {
        let mut state = self.state.lock();
        state.servers.insert(
            server_key(&info.host, info.pid, &info.server_id),
            ServerEntry {
                info: info.clone(),
                workers: workers.to_vec(),
                expires_at: time_after(SystemTime::now(), ttl),
            },
        );
        Ok(())
    }

    async fn clear_server_state(&self, host: &str, pid: u32, server_id: &str) -> ForgeResult<()> {
        self.state
            .lock()
            .servers
            .remove(&server_key(host, pid, server_id));
        Ok(())
    }

    async fn cancelation_pubsub(&self) -> ForgeResult<CancelationStream> {
        let rx = self.cancel_tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(id) => return Some((id, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Cancelation subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn publish_cancelation(&self, id: &str) -> ForgeResult<()> {
        // Nobody listening is not an error.
        let _ = self.cancel_tx.send(id.to_string());
        Ok(())
    }

    async fn close(&self) -> ForgeResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
