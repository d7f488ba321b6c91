//! Task definitions and the store-side task representation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unique identifier for a task
pub type TaskId = String;

/// Longest attempt a message can ask for. Larger timeouts and deadlines are
/// clamped to this so deadline arithmetic never overflows.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A unit of work: a type name used for routing plus an opaque payload.
///
/// Tasks are immutable once built. A task may carry follow-up tasks which are
/// enqueued once it completes successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    type_name: String,
    payload: Vec<u8>,
    done_calls: Vec<Task>,
}

impl Task {
    /// Create a task from a type name and payload bytes.
    pub fn new(type_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            payload: payload.into(),
            done_calls: Vec::new(),
        }
    }

    /// Create a task whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(
        type_name: impl Into<String>,
        value: &T,
    ) -> crate::error::ForgeResult<Self> {
        Ok(Self::new(type_name, serde_json::to_vec(value)?))
    }

    /// Append a follow-up task to run after this one succeeds.
    pub fn with_done_call(mut self, task: Task) -> Self {
        self.done_calls.push(task);
        self
    }

    /// Type name used for routing.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as JSON.
    pub fn payload_json<T: for<'de> Deserialize<'de>>(&self) -> crate::error::ForgeResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Follow-up tasks.
    pub fn done_calls(&self) -> &[Task] {
        &self.done_calls
    }
}

/// Placement of a task message in the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Pending, waiting to be dequeued
    Active,
    /// Currently executing on some worker
    Doing,
    /// Completed successfully
    Done,
    /// Waiting for its process time (delayed or retry)
    Scheduled,
    /// Permanently failed
    Archived,
}

impl TaskState {
    /// Lower-case label of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Active => "active",
            TaskState::Doing => "doing",
            TaskState::Done => "done",
            TaskState::Scheduled => "scheduled",
            TaskState::Archived => "archived",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-side representation of a task.
///
/// The engine never mutates a message to change its placement; every
/// transition goes through a [`Broker`](crate::broker::Broker) operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskMessage {
    /// Type name of the task
    pub type_name: String,
    /// Unique task identifier
    pub id: TaskId,
    /// Optional human readable name
    pub name: Option<String>,
    /// Queue the task belongs to
    pub queue: String,
    /// Current placement
    pub state: TaskState,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Maximum number of retries
    pub retry: u32,
    /// Number of retries performed so far
    pub retried: u32,
    /// Error message from the last failed attempt
    pub error_msg: Option<String>,
    /// Per-attempt timeout in seconds, 0 if none
    pub timeout: u64,
    /// Absolute deadline as unix seconds, 0 if none
    pub deadline: i64,
    /// Uniqueness key held while the task is outstanding
    pub unique_key: Option<String>,
    /// Follow-up tasks enqueued when this one is done
    pub done_calls: Vec<TaskMessage>,
}

impl TaskMessage {
    /// Build the handler-facing task from this message.
    pub fn to_task(&self) -> Task {
        Task::new(self.type_name.clone(), self.payload.clone())
    }

    /// Absolute deadline if one is set.
    pub fn deadline_time(&self) -> Option<SystemTime> {
        (self.deadline > 0).then(|| from_unix_secs(self.deadline))
    }

    /// Per-attempt timeout if one is set.
    pub fn timeout_duration(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout).min(MAX_TIMEOUT))
    }

    /// Deadline of an attempt started at `now`: the earlier of the absolute
    /// deadline and `now + timeout`.
    pub fn effective_deadline(&self, now: SystemTime) -> Option<SystemTime> {
        let by_timeout = self.timeout_duration().map(|t| time_after(now, t));
        match (by_timeout, self.deadline_time()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Information about an enqueued task, returned to producers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task identifier
    pub id: TaskId,
    /// Queue name
    pub queue: String,
    /// Task type
    pub type_name: String,
    /// Optional human readable name
    pub name: Option<String>,
    /// Placement at the time of the call
    pub state: TaskState,
    /// Payload
    pub payload: Vec<u8>,
    /// Absolute deadline if one is set
    pub deadline: Option<SystemTime>,
    /// Follow-up tasks
    pub done_calls: Vec<TaskMessage>,
}

impl From<&TaskMessage> for TaskInfo {
    fn from(msg: &TaskMessage) -> Self {
        Self {
            id: msg.id.clone(),
            queue: msg.queue.clone(),
            type_name: msg.type_name.clone(),
            name: msg.name.clone(),
            state: msg.state,
            payload: msg.payload.clone(),
            deadline: msg.deadline_time(),
            done_calls: msg.done_calls.clone(),
        }
    }
}

/// Snapshot of a server process, written to the store as telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: String,
    pub pid: u32,
    pub server_id: String,
    pub concurrency: usize,
    pub queues: HashMap<String, u32>,
    pub status: String,
    pub started: SystemTime,
    pub active_worker_count: usize,
}

/// Snapshot of one in-flight task execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInfo {
    pub host: String,
    pub pid: u32,
    pub server_id: String,
    pub task_id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub started: SystemTime,
    pub deadline: SystemTime,
}

/// Convert a timestamp to unix seconds, clamping pre-epoch times to 0.
pub fn unix_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `time + delay`, with `delay` clamped to [`MAX_TIMEOUT`].
pub fn time_after(time: SystemTime, delay: Duration) -> SystemTime {
    time.checked_add(delay.min(MAX_TIMEOUT)).unwrap_or(time)
}

/// Convert unix seconds back to a timestamp.
pub fn from_unix_secs(secs: i64) -> SystemTime {
    let since_epoch = Duration::from_secs(secs.max(0) as u64);
    UNIX_EPOCH
        .checked_add(since_epoch)
        .unwrap_or_else(|| time_after(SystemTime::now(), MAX_TIMEOUT))
}
