//! The taskforge engine - wires the processor and its background components
//! to one broker.
//!
//! The engine is responsible for:
//! - Running handlers under bounded concurrency (processor)
//! - Promoting due scheduled tasks (forwarder)
//! - Retrying failed store writes (syncer)
//! - Recovering tasks stuck past their deadline (recoverer)
//! - Publishing server telemetry (heartbeater)
//! - Applying cross-process cancellations (subscriber)

use crate::broker::Broker;
use crate::config::ForgeConfig;
use crate::core::ServiceHandle;
use crate::core::cancel::{self, Cancelations};
use crate::core::forwarder::Forwarder;
use crate::core::heartbeat::{Heartbeater, HeartbeaterParams};
use crate::core::mux::Handler;
use crate::core::processor::{IsFailureFn, Processor, ProcessorParams, RetryDelayFn};
use crate::core::recoverer::Recoverer;
use crate::core::syncer::Syncer;
use crate::error::{ForgeError, ForgeResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};

/// Components started by [`Engine::start`].
struct Components {
    forwarder: ServiceHandle,
    processor: Processor,
    recoverer: ServiceHandle,
    syncer: ServiceHandle,
    subscriber: ServiceHandle,
    heartbeater: ServiceHandle,
}

/// The main taskforge engine that orchestrates all components
pub struct Engine {
    /// Configuration
    config: ForgeConfig,
    /// Store backend
    broker: Arc<dyn Broker>,
    /// Root handler, usually a `ServeMux`
    handler: Arc<dyn Handler>,
    is_failure: IsFailureFn,
    retry_delay: RetryDelayFn,
    cancelations: Arc<Cancelations>,
    /// Running components, taken on shutdown
    components: Mutex<Option<Components>>,
    /// Control flags
    is_running: AtomicBool,
    is_shut_down: AtomicBool,
    /// Engine start time for uptime tracking
    start_time: parking_lot::Mutex<Option<Instant>>,
}

impl Engine {
    /// Create a new engine. Every handler error counts as a failure and
    /// retries are delayed according to `config.retry`.
    pub fn new(config: ForgeConfig, broker: Arc<dyn Broker>, handler: Arc<dyn Handler>) -> Self {
        let policy = config.retry.clone();
        Self {
            config,
            broker,
            handler,
            is_failure: Arc::new(|_| true),
            retry_delay: Arc::new(move |retried, _, _| policy.delay(retried)),
            cancelations: Arc::new(Cancelations::new()),
            components: Mutex::new(None),
            is_running: AtomicBool::new(false),
            is_shut_down: AtomicBool::new(false),
            start_time: parking_lot::Mutex::new(None),
        }
    }

    /// Replace the classifier deciding whether an error counts toward the
    /// retry limit.
    pub fn with_is_failure(mut self, is_failure: IsFailureFn) -> Self {
        self.is_failure = is_failure;
        self
    }

    /// Replace the function computing the delay before a retry.
    pub fn with_retry_delay(mut self, retry_delay: RetryDelayFn) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Start the engine and all its components
    pub async fn start(&self) -> ForgeResult<()> {
        let mut components = self.components.lock().await;
        if components.is_some() {
            return Err(ForgeError::AlreadyRunning);
        }
        if self.is_shut_down.load(Ordering::Acquire) {
            return Err(ForgeError::config("engine cannot be restarted after shutdown"));
        }
        self.config
            .validate()
            .map_err(|errors| ForgeError::config(errors.join("; ")))?;
        self.broker.ping().await?;

        let queues = self.config.queues.resolved_queues();
        let engine = &self.config.engine;
        let workers = &self.config.workers;

        tracing::info!(
            concurrency = workers.concurrency,
            queues = ?queues,
            server_id = %engine.server_id,
            "Starting taskforge engine"
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        let (syncer, sync_tx) = Syncer::new(Duration::from_millis(engine.sync_interval_ms));

        let heartbeater = Heartbeater::new(HeartbeaterParams {
            broker: Arc::clone(&self.broker),
            interval: Duration::from_millis(engine.heartbeat_interval_ms),
            host: engine.host.clone(),
            server_id: engine.server_id.clone(),
            concurrency: workers.concurrency,
            queues: self.config.queues.queues.clone(),
            events: events_rx,
        });

        let processor = Processor::new(ProcessorParams {
            broker: Arc::clone(&self.broker),
            handler: Arc::clone(&self.handler),
            queues: queues.clone(),
            concurrency: workers.concurrency,
            is_failure: Arc::clone(&self.is_failure),
            retry_delay: Arc::clone(&self.retry_delay),
            sync_tx,
            cancelations: Arc::clone(&self.cancelations),
            events,
            shutdown_timeout: workers.shutdown_timeout(),
            poll_backoff: workers.poll_backoff(),
        });

        let syncer = syncer.start();
        let forwarder = Forwarder::new(
            Arc::clone(&self.broker),
            queues.clone(),
            Duration::from_millis(engine.forward_interval_ms),
        )
        .start();
        let recoverer = Recoverer::new(
            Arc::clone(&self.broker),
            queues,
            Duration::from_millis(engine.recover_interval_ms),
            Arc::clone(&self.is_failure),
            Arc::clone(&self.retry_delay),
        )
        .start();
        let heartbeater = heartbeater.start();
        let subscriber =
            cancel::spawn_subscriber(Arc::clone(&self.broker), Arc::clone(&self.cancelations));
        processor.start();

        *components = Some(Components {
            forwarder,
            processor,
            recoverer,
            syncer,
            subscriber,
            heartbeater,
        });
        self.is_running.store(true, Ordering::Release);
        *self.start_time.lock() = Some(Instant::now());

        tracing::info!("Taskforge engine started successfully");
        Ok(())
    }

    /// Stop dequeuing new tasks. In-flight tasks and background components
    /// keep running until [`Engine::shutdown`].
    pub async fn stop(&self) {
        if let Some(components) = self.components.lock().await.as_ref() {
            tracing::info!("Stopping processor...");
            components.processor.stop();
        }
    }

    /// Shutdown the engine gracefully. Handlers still running after the
    /// configured shutdown timeout are abandoned and their tasks requeued.
    pub async fn shutdown(&self) -> ForgeResult<()> {
        let Some(components) = self.components.lock().await.take() else {
            return Err(ForgeError::NotRunning);
        };

        tracing::info!("Shutting down taskforge engine...");
        self.is_shut_down.store(true, Ordering::Release);

        let Components {
            forwarder,
            processor,
            recoverer,
            syncer,
            subscriber,
            heartbeater,
        } = components;

        forwarder.shutdown().await;
        processor.shutdown().await;
        recoverer.shutdown().await;
        syncer.shutdown().await;
        subscriber.shutdown().await;
        heartbeater.shutdown().await;

        if let Err(e) = self.broker.close().await {
            tracing::error!(error = %e, "Could not close broker");
        }

        self.is_running.store(false, Ordering::Release);
        tracing::info!("Taskforge engine shutdown complete");
        Ok(())
    }

    /// Wait for Ctrl+C, then shut down.
    pub async fn wait_for_signal(&self) -> ForgeResult<()> {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown..."),
            Err(e) => tracing::error!(error = %e, "Could not listen for Ctrl+C, shutting down"),
        }
        self.shutdown().await
    }

    /// Perform a health check
    pub async fn health_check(&self) -> ForgeResult<()> {
        if !self.is_running() {
            return Err(ForgeError::NotRunning);
        }
        self.broker.ping().await
    }

    /// Registry of the tasks executing in this process.
    pub fn cancelations(&self) -> &Arc<Cancelations> {
        &self.cancelations
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Get engine uptime
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.lock().map(|start| start.elapsed())
    }

    /// Check if engine is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::core::mux::ServeMux;
    use crate::core::test_support::{message, wait_until};
    use crate::error::ErrorCode;
    use crate::task::{Task, TaskState, unix_secs};
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    fn counting_mux(count: Arc<AtomicUsize>) -> Arc<ServeMux> {
        let mux = ServeMux::new();
        mux.handle_func("test_task", move |_ctx, _task: Task| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        Arc::new(mux)
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::new(ForgeConfig::testing(), broker, Arc::new(ServeMux::new()));
        assert!(!engine.is_running());
        assert!(engine.uptime().is_none());
        assert!(matches!(engine.health_check().await, Err(ForgeError::NotRunning)));
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let broker = Arc::new(InMemoryBroker::new());
        let count = Arc::new(AtomicUsize::new(0));
        let engine = Engine::new(ForgeConfig::testing(), broker.clone(), counting_mux(count.clone()));

        // Start engine
        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(engine.health_check().await.is_ok());

        broker.enqueue(&message("t-1", "default")).await.unwrap();
        let mut later = message("t-2", "default");
        later.state = TaskState::Scheduled;
        broker
            .schedule(&later, SystemTime::now() + Duration::from_millis(30))
            .await
            .unwrap();

        assert!(wait_until(|| broker.stats("default").processed == 2).await);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let config = engine.config().engine.clone();
        assert!(
            wait_until(|| broker
                .server_state(&config.host, std::process::id(), &config.server_id)
                .is_some())
            .await
        );

        // Shutdown engine
        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());
        assert!(
            broker
                .server_state(&config.host, std::process::id(), &config.server_id)
                .is_none()
        );
        assert!(broker.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_double_start_and_restart_are_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::new(ForgeConfig::testing(), broker, Arc::new(ServeMux::new()));

        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(ForgeError::AlreadyRunning)));

        engine.shutdown().await.unwrap();
        assert!(matches!(engine.shutdown().await, Err(ForgeError::NotRunning)));
        assert!(matches!(engine.start().await, Err(ForgeError::Config { .. })));
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_is_down() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.close().await.unwrap();
        let engine = Engine::new(ForgeConfig::testing(), broker, Arc::new(ServeMux::new()));

        let err = engine.start().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = ForgeConfig::testing();
        config.workers.concurrency = 0;
        let engine = Engine::new(config, Arc::new(InMemoryBroker::new()), Arc::new(ServeMux::new()));
        assert!(matches!(engine.start().await, Err(ForgeError::Config { .. })));
    }

    #[tokio::test]
    async fn test_stop_halts_dequeue_only() {
        let broker = Arc::new(InMemoryBroker::new());
        let count = Arc::new(AtomicUsize::new(0));
        let engine = Engine::new(ForgeConfig::testing(), broker.clone(), counting_mux(count.clone()));
        engine.start().await.unwrap();

        engine.stop().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.enqueue(&message("t-1", "default")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(broker.stats("default").pending, 1);
        assert!(engine.is_running());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unrouted_task_is_retried_with_reason() {
        let broker = Arc::new(InMemoryBroker::new());
        let engine = Engine::new(ForgeConfig::testing(), broker.clone(), Arc::new(ServeMux::new()));
        engine.start().await.unwrap();

        broker.enqueue(&message("t-1", "default")).await.unwrap();
        assert!(wait_until(|| broker.stats("default").failed >= 1).await);
        engine.shutdown().await.unwrap();

        let msg = broker.get_task("default", "t-1").unwrap();
        assert!(msg.error_msg.unwrap().contains("test_task"));
    }

    #[tokio::test]
    async fn test_cancel_broadcast_reaches_running_task() {
        let broker = Arc::new(InMemoryBroker::new());
        let mux = ServeMux::new();
        mux.handle_func("test_task", |ctx: crate::core::TaskContext, _task: Task| async move {
            Err(ctx.done().await)
        });
        let mut config = ForgeConfig::testing();
        config.retry = crate::config::RetryPolicy::fixed(3, 60_000);
        let engine = Engine::new(config, broker.clone(), Arc::new(mux));
        engine.start().await.unwrap();

        let mut msg = message("t-1", "default");
        msg.deadline = unix_secs(SystemTime::now()) + 3600;
        broker.enqueue(&msg).await.unwrap();
        assert!(wait_until(|| engine.cancelations().get("t-1").is_some()).await);

        // The subscription is established asynchronously; keep publishing
        // until the task leaves the active set.
        let resolved = tokio::time::timeout(Duration::from_secs(2), async {
            while broker.stats("default").active > 0 {
                broker.publish_cancelation("t-1").await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(resolved.is_ok());
        engine.shutdown().await.unwrap();

        let msg = broker.get_task("default", "t-1").unwrap();
        assert_eq!(msg.error_msg.as_deref(), Some("context canceled"));
    }
}
