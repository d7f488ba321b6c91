//! Deadline-bound, cancellable execution context handed to handlers.

use crate::error::ForgeError;
use crate::task::{MAX_TIMEOUT, TaskId, TaskMessage};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Execution context of one task attempt.
///
/// The context becomes done when its deadline passes or when its
/// cancellation trigger fires, whichever happens first. Handlers should
/// select on [`TaskContext::done`] around long-running work.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    queue: String,
    retry_count: u32,
    max_retry: u32,
    deadline: SystemTime,
    expires_at: Instant,
    token: CancellationToken,
}

impl TaskContext {
    /// Create a context for `task_id` expiring at `deadline`.
    pub fn new(task_id: impl Into<TaskId>, deadline: SystemTime) -> Self {
        let remaining = deadline
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
            .min(MAX_TIMEOUT);
        Self {
            task_id: task_id.into(),
            queue: String::new(),
            retry_count: 0,
            max_retry: 0,
            deadline,
            expires_at: Instant::now() + remaining,
            token: CancellationToken::new(),
        }
    }

    /// Create the context of a dequeued message.
    pub(crate) fn for_message(msg: &TaskMessage, deadline: SystemTime) -> Self {
        let mut ctx = Self::new(msg.id.clone(), deadline);
        ctx.queue = msg.queue.clone();
        ctx.retry_count = msg.retried;
        ctx.max_retry = msg.retry;
        ctx
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Number of times the task has been retried before this attempt.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn deadline(&self) -> SystemTime {
        self.deadline
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ForgeError> {
        if self.token.is_cancelled() {
            Some(ForgeError::Canceled)
        } else if Instant::now() >= self.expires_at {
            Some(ForgeError::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> ForgeError {
        tokio::select! {
            _ = self.token.cancelled() => ForgeError::Canceled,
            _ = tokio::time::sleep_until(self.expires_at) => ForgeError::DeadlineExceeded,
        }
    }

    /// Fire the cancellation trigger. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_live_context() {
        let ctx = TaskContext::new("t-1", SystemTime::now() + Duration::from_secs(60));
        assert!(ctx.err().is_none());
        assert_eq!(ctx.task_id(), "t-1");
    }

    #[tokio::test]
    async fn test_past_deadline_is_done_immediately() {
        let ctx = TaskContext::new("t-1", SystemTime::now() - Duration::from_secs(5));
        assert!(matches!(ctx.err(), Some(ForgeError::DeadlineExceeded)));
        assert!(matches!(ctx.done().await, ForgeError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_far_deadline_is_clamped() {
        let far = crate::task::from_unix_secs(i64::MAX);
        let ctx = TaskContext::new("t-1", far);
        assert!(ctx.err().is_none());
        assert_eq!(ctx.deadline(), far);
    }

    #[tokio::test]
    async fn test_deadline_fires_done() {
        let ctx = TaskContext::new("t-1", SystemTime::now() + Duration::from_millis(50));
        let err = tokio::time::timeout(Duration::from_secs(2), ctx.done())
            .await
            .expect("deadline should fire");
        assert!(matches!(err, ForgeError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_fires_done_on_clones() {
        let ctx = TaskContext::new("t-1", SystemTime::now() + Duration::from_secs(60));
        let seen_by_handler = ctx.clone();

        ctx.cancel();
        ctx.cancel();

        assert!(matches!(seen_by_handler.done().await, ForgeError::Canceled));
        assert!(matches!(seen_by_handler.err(), Some(ForgeError::Canceled)));
    }
}
