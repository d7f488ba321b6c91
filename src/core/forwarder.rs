//! Promotion of due scheduled and retry tasks into their pending queues.

use crate::broker::Broker;
use crate::core::ServiceHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodically asks the broker to forward tasks whose process time arrived.
pub struct Forwarder {
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    interval: Duration,
}

impl Forwarder {
    pub fn new(broker: Arc<dyn Broker>, queues: Vec<String>, interval: Duration) -> Self {
        Self {
            broker,
            queues,
            interval,
        }
    }

    /// Spawn the forwarder loop.
    pub fn start(self) -> ServiceHandle {
        let done = CancellationToken::new();
        let stop = done.clone();

        let join = tokio::spawn(async move {
            tracing::debug!(queues = ?self.queues, "Forwarder started");

            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.interval,
                self.interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => self.exec().await,
                }
            }

            tracing::debug!("Forwarder stopped");
        });

        ServiceHandle::new("forwarder", done, join)
    }

    // A due task stays due, so a failed tick only delays it to the next one.
    async fn exec(&self) {
        if let Err(e) = self.broker.forward_if_ready(&self.queues).await {
            tracing::warn!(error = %e, "Could not enqueue scheduled tasks");
        }
    }
}
