//! Producer-side API: enqueue tasks and request cancellations.

use crate::broker::Broker;
use crate::config::ForgeConfig;
use crate::error::{ErrorCode, ForgeError, ForgeResult};
use crate::task::{Task, TaskId, TaskInfo, TaskMessage, TaskState, time_after, unix_secs};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Per-enqueue options. Unset fields fall back to the client defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    queue: Option<String>,
    max_retry: Option<u32>,
    timeout: Option<Duration>,
    deadline: Option<SystemTime>,
    process_at: Option<SystemTime>,
    unique_ttl: Option<Duration>,
    name: Option<String>,
    task_id: Option<TaskId>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue to put the task in.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Maximum number of retries before the task is archived.
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Absolute deadline across all attempts.
    pub fn deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Process the task no earlier than `at`.
    pub fn process_at(mut self, at: SystemTime) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Process the task no earlier than `delay` from now.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_at = Some(time_after(SystemTime::now(), delay));
        self
    }

    /// Reject duplicates of this task (same queue, type and payload) for `ttl`.
    pub fn unique(mut self, ttl: Duration) -> Self {
        self.unique_ttl = Some(ttl);
        self
    }

    /// Human readable name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Use a caller-chosen task ID instead of a random one.
    pub fn task_id(mut self, id: impl Into<TaskId>) -> Self {
        self.task_id = Some(id.into());
        self
    }
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    broker: Arc<dyn Broker>,
    default_queue: String,
    default_max_retry: u32,
    default_timeout: Duration,
}

impl Client {
    /// Create a client with the default queue `"default"`, 25 retries and a
    /// 30 minute timeout.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::from_config(broker, &ForgeConfig::default())
    }

    /// Create a client whose defaults come from `config`.
    pub fn from_config(broker: Arc<dyn Broker>, config: &ForgeConfig) -> Self {
        Self {
            broker,
            default_queue: config.queues.default_queue.clone(),
            default_max_retry: config.retry.max_retry,
            default_timeout: Duration::from_secs(config.workers.default_timeout_secs),
        }
    }

    /// Enqueue `task`. Fails with [`ForgeError::DuplicateTask`] when a unique
    /// task with the same key is still outstanding.
    pub async fn enqueue(&self, task: Task, opts: EnqueueOptions) -> ForgeResult<TaskInfo> {
        if task.type_name().trim().is_empty() {
            return Err(ForgeError::op(
                "client.enqueue",
                ErrorCode::FailedPrecondition,
                "task type name cannot be empty",
            ));
        }

        let now = SystemTime::now();
        let mut msg = self.message(&task, &opts);
        if let Some(id) = opts.task_id.clone() {
            msg.id = id;
        }
        if let Some(ttl) = opts.unique_ttl {
            if ttl < Duration::from_secs(1) {
                return Err(ForgeError::op(
                    "client.enqueue",
                    ErrorCode::FailedPrecondition,
                    "unique TTL cannot be less than 1s",
                ));
            }
            msg.unique_key = Some(unique_key(&msg.queue, task.type_name(), task.payload()));
        }

        let scheduled = opts.process_at.filter(|at| *at > now);
        match (scheduled, opts.unique_ttl) {
            (Some(at), Some(ttl)) => {
                msg.state = TaskState::Scheduled;
                self.broker.schedule_unique(&msg, at, ttl).await?;
            }
            (Some(at), None) => {
                msg.state = TaskState::Scheduled;
                self.broker.schedule(&msg, at).await?;
            }
            (None, Some(ttl)) => self.broker.enqueue_unique(&msg, ttl).await?,
            (None, None) => self.broker.enqueue(&msg).await?,
        }

        tracing::debug!(
            task_id = %msg.id,
            task_type = %msg.type_name,
            queue = %msg.queue,
            state = %msg.state,
            "Enqueued task"
        );
        Ok(TaskInfo::from(&msg))
    }

    /// Request cancellation of a task executing on any server.
    pub async fn cancel(&self, id: &str) -> ForgeResult<()> {
        self.broker.publish_cancelation(id).await
    }

    fn message(&self, task: &Task, opts: &EnqueueOptions) -> TaskMessage {
        let queue = opts
            .queue
            .clone()
            .unwrap_or_else(|| self.default_queue.clone());

        let (timeout, deadline) = match (opts.timeout, opts.deadline) {
            (None, None) => (self.default_timeout.as_secs(), 0),
            (timeout, deadline) => (
                timeout.map(|t| t.as_secs()).unwrap_or(0),
                deadline.map(unix_secs).unwrap_or(0),
            ),
        };

        // Follow-ups inherit the queue but none of the scheduling options.
        let follow_up = EnqueueOptions::new().queue(queue.clone());
        TaskMessage {
            type_name: task.type_name().to_string(),
            id: Uuid::new_v4().to_string(),
            name: opts.name.clone(),
            queue,
            state: TaskState::Active,
            payload: task.payload().to_vec(),
            retry: opts.max_retry.unwrap_or(self.default_max_retry),
            retried: 0,
            error_msg: None,
            timeout,
            deadline,
            unique_key: None,
            done_calls: task
                .done_calls()
                .iter()
                .map(|next| self.message(next, &follow_up))
                .collect(),
        }
    }
}

/// Uniqueness key of a task: queue, type and a digest of the payload.
fn unique_key(queue: &str, type_name: &str, payload: &[u8]) -> String {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, payload);
    format!("taskforge:{{{queue}}}:unique:{type_name}:{}", digest.simple())
}
