//! Recovery of tasks left active past their deadline.
//!
//! A worker that dies without resolving its task (process crash, abandoned
//! store write) leaves the task active forever. The recoverer periodically
//! lists such tasks and retries or archives them with a deadline-exceeded
//! cause.

use crate::broker::Broker;
use crate::core::ServiceHandle;
use crate::core::processor::{IsFailureFn, RetryDelayFn};
use crate::error::ForgeError;
use crate::task::{TaskMessage, time_after};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// How long past its deadline a task must be before it is recovered.
const RECOVERY_MARGIN: Duration = Duration::from_secs(30);

pub struct Recoverer {
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    interval: Duration,
    is_failure: IsFailureFn,
    retry_delay: RetryDelayFn,
}

impl Recoverer {
    pub fn new(
        broker: Arc<dyn Broker>,
        queues: Vec<String>,
        interval: Duration,
        is_failure: IsFailureFn,
        retry_delay: RetryDelayFn,
    ) -> Self {
        Self {
            broker,
            queues,
            interval,
            is_failure,
            retry_delay,
        }
    }

    /// Spawn the recoverer loop. The first scan runs immediately.
    pub fn start(self) -> ServiceHandle {
        let done = CancellationToken::new();
        let stop = done.clone();

        let join = tokio::spawn(async move {
            tracing::debug!("Recoverer started");

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => self.recover().await,
                }
            }

            tracing::debug!("Recoverer stopped");
        });

        ServiceHandle::new("recoverer", done, join)
    }

    async fn recover(&self) {
        let cutoff = SystemTime::now() - RECOVERY_MARGIN;
        let stale = match self.broker.list_deadline_exceeded(cutoff, &self.queues).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list deadline exceeded tasks");
                return;
            }
        };

        for msg in stale {
            tracing::info!(task_id = %msg.id, queue = %msg.queue, "Recovering task past its deadline");
            self.resolve(&msg).await;
        }
    }

    async fn resolve(&self, msg: &TaskMessage) {
        let err = ForgeError::DeadlineExceeded;
        let err_msg = err.to_string();
        let is_failure = (self.is_failure)(&err);

        let result = if is_failure && msg.retried >= msg.retry {
            self.broker.archive(msg, &err_msg).await
        } else {
            let delay = (self.retry_delay)(msg.retried, &err, &msg.to_task());
            self.broker
                .retry(msg, time_after(SystemTime::now(), delay), &err_msg, is_failure)
                .await
        };

        if let Err(e) = result {
            tracing::warn!(task_id = %msg.id, error = %e, "Could not recover task");
        }
    }
}
