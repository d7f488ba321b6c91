//! Server and worker telemetry.
//!
//! The heartbeater tracks the tasks currently executing from the processor's
//! [`WorkerEvent`]s and periodically writes a snapshot
//! of the server and its workers to the broker. Snapshots expire after two
//! intervals, so a crashed server disappears on its own.

use crate::broker::Broker;
use crate::core::ServiceHandle;
use crate::core::processor::{WorkerEvent, WorkerStarted};
use crate::task::{ServerInfo, TaskId, WorkerInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Construction parameters of a [`Heartbeater`].
pub struct HeartbeaterParams {
    pub broker: Arc<dyn Broker>,
    pub interval: Duration,
    pub host: String,
    pub server_id: String,
    pub concurrency: usize,
    pub queues: HashMap<String, u32>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

pub struct Heartbeater {
    broker: Arc<dyn Broker>,
    interval: Duration,
    info: ServerInfo,
    workers: HashMap<TaskId, WorkerInfo>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Heartbeater {
    pub fn new(params: HeartbeaterParams) -> Self {
        Self {
            broker: params.broker,
            interval: params.interval,
            info: ServerInfo {
                host: params.host,
                pid: std::process::id(),
                server_id: params.server_id,
                concurrency: params.concurrency,
                queues: params.queues,
                status: "active".to_string(),
                started: SystemTime::now(),
                active_worker_count: 0,
            },
            workers: HashMap::new(),
            events: params.events,
        }
    }

    /// Spawn the heartbeat loop. The first snapshot is written immediately.
    pub fn start(self) -> ServiceHandle {
        let done = CancellationToken::new();
        let stop = done.clone();
        let join = tokio::spawn(self.run(stop));
        ServiceHandle::new("heartbeater", done, join)
    }

    async fn run(mut self, stop: CancellationToken) {
        tracing::debug!(server_id = %self.info.server_id, "Heartbeater started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.beat().await,
                event = self.events.recv(), if events_open => match event {
                    Some(WorkerEvent::Started(w)) => self.track(w),
                    Some(WorkerEvent::Finished(msg)) => {
                        self.workers.remove(&msg.id);
                    }
                    None => events_open = false,
                },
            }
        }

        let info = &self.info;
        if let Err(e) = self
            .broker
            .clear_server_state(&info.host, info.pid, &info.server_id)
            .await
        {
            tracing::error!(error = %e, "Could not clear server state");
        }

        tracing::debug!("Heartbeater stopped");
    }

    fn track(&mut self, started: WorkerStarted) {
        let WorkerStarted {
            msg,
            started,
            deadline,
        } = started;
        self.workers.insert(
            msg.id.clone(),
            WorkerInfo {
                host: self.info.host.clone(),
                pid: self.info.pid,
                server_id: self.info.server_id.clone(),
                task_id: msg.id,
                task_type: msg.type_name,
                payload: msg.payload,
                queue: msg.queue,
                started,
                deadline,
            },
        );
    }

    async fn beat(&mut self) {
        self.info.active_worker_count = self.workers.len();
        let workers: Vec<WorkerInfo> = self.workers.values().cloned().collect();

        if let Err(e) = self
            .broker
            .write_server_state(&self.info, &workers, self.interval * 2)
            .await
        {
            tracing::error!(error = %e, "Could not write server state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{FlakyBroker, message, wait_until};
    use crate::task::TaskMessage;

    fn started(msg: &TaskMessage) -> WorkerEvent {
        WorkerEvent::Started(WorkerStarted {
            msg: msg.clone(),
            started: SystemTime::now(),
            deadline: SystemTime::now() + Duration::from_secs(60),
        })
    }

    fn params(broker: Arc<FlakyBroker>, events: mpsc::UnboundedReceiver<WorkerEvent>) -> HeartbeaterParams {
        HeartbeaterParams {
            broker,
            interval: Duration::from_millis(20),
            host: "host-a".to_string(),
            server_id: "srv-1".to_string(),
            concurrency: 4,
            queues: HashMap::from([("default".to_string(), 1)]),
            events,
        }
    }

    #[tokio::test]
    async fn test_snapshot_tracks_in_flight_workers() {
        let broker = Arc::new(FlakyBroker::new());
        let (events_tx, events) = mpsc::unbounded_channel();

        let handle = Heartbeater::new(params(broker.clone(), events)).start();

        let pid = std::process::id();
        let msg = message("t-1", "default");
        events_tx.send(started(&msg)).unwrap();

        assert!(
            wait_until(|| {
                broker
                    .inner()
                    .server_state("host-a", pid, "srv-1")
                    .is_some_and(|(info, workers)| {
                        info.active_worker_count == 1 && workers[0].task_id == "t-1"
                    })
            })
            .await
        );

        events_tx.send(WorkerEvent::Finished(msg)).unwrap();
        assert!(
            wait_until(|| {
                broker
                    .inner()
                    .server_state("host-a", pid, "srv-1")
                    .is_some_and(|(info, workers)| info.active_worker_count == 0 && workers.is_empty())
            })
            .await
        );

        handle.shutdown().await;
        assert!(broker.inner().server_state("host-a", pid, "srv-1").is_none());
        assert_eq!(broker.calls().clear_server_state, 1);
    }

    #[tokio::test]
    async fn test_tasks_finished_before_first_beat_leave_no_workers() {
        let broker = Arc::new(FlakyBroker::new());
        let (events_tx, events) = mpsc::unbounded_channel();

        for i in 0..50 {
            let msg = message(&format!("t-{i}"), "default");
            events_tx.send(started(&msg)).unwrap();
            events_tx.send(WorkerEvent::Finished(msg)).unwrap();
        }
        let handle = Heartbeater::new(params(broker.clone(), events)).start();

        let pid = std::process::id();
        assert!(wait_until(|| broker.inner().server_state("host-a", pid, "srv-1").is_some()).await);
        // A few more beats so every queued event has been applied.
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (info, workers) = broker.inner().server_state("host-a", pid, "srv-1").unwrap();
        assert_eq!(info.active_worker_count, 0);
        assert!(workers.is_empty());
        handle.shutdown().await;
    }
}
