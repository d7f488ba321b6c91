//! Cancellation of in-flight tasks.
//!
//! [`Cancelations`] maps the ID of each task executing in this process to its
//! cancellation trigger. The [`spawn_subscriber`] loop listens to the broker's
//! cross-process cancellation broadcast and fires the matching trigger.

use crate::broker::Broker;
use crate::core::ServiceHandle;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay before retrying a failed subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Process-local registry of cancellation triggers, keyed by task ID.
#[derive(Debug, Default)]
pub struct Cancelations {
    triggers: DashMap<String, CancellationToken>,
}

impl Cancelations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the trigger of a task that starts executing.
    pub fn add(&self, id: impl Into<String>, token: CancellationToken) {
        self.triggers.insert(id.into(), token);
    }

    /// Look up the trigger of an in-flight task.
    pub fn get(&self, id: &str) -> Option<CancellationToken> {
        self.triggers.get(id).map(|t| t.value().clone())
    }

    /// Forget the trigger of a task that finished executing.
    pub fn delete(&self, id: &str) {
        self.triggers.remove(id);
    }

    /// Fire the trigger of `id` if the task runs here. Returns whether it did.
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of registered in-flight tasks.
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

/// Start the loop applying cancellation broadcasts to `cancelations`.
pub fn spawn_subscriber(broker: Arc<dyn Broker>, cancelations: Arc<Cancelations>) -> ServiceHandle {
    let done = CancellationToken::new();
    let stop = done.clone();

    let join = tokio::spawn(async move {
        tracing::debug!("Cancelation subscriber started");

        let mut stream = loop {
            match broker.cancelation_pubsub().await {
                Ok(stream) => break stream,
                Err(e) => {
                    tracing::error!(error = %e, "Cannot subscribe to cancelation channel, retrying in {:?}", RESUBSCRIBE_DELAY);
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    }
                }
            }
        };

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                id = stream.next() => match id {
                    Some(id) => {
                        if cancelations.cancel(&id) {
                            tracing::info!(task_id = %id, "Canceled in-flight task");
                        }
                    }
                    None => {
                        tracing::warn!("Cancelation channel closed");
                        stop.cancelled().await;
                        break;
                    }
                },
            }
        }

        tracing::debug!("Cancelation subscriber stopped");
    });

    ServiceHandle::new("subscriber", done, join)
}
