//! The worker pool.
//!
//! The processor dequeues tasks under a semaphore of `concurrency` slots and
//! runs each one in its own tokio task. A dequeued task resolves in exactly
//! one of three ways:
//!
//! - the handler succeeds: the task is marked done (handed to the syncer if
//!   the store write fails);
//! - the handler fails, panics, or the task context ends first: the task is
//!   retried or archived;
//! - the shutdown grace period elapses: the task is requeued and the handler
//!   is abandoned.
//!
//! Whatever happens, the slot is released and a [`WorkerEvent::Finished`] is
//! sent on the same channel as the task's [`WorkerEvent::Started`], so
//! observers always see the two in order.

use crate::broker::Broker;
use crate::core::cancel::Cancelations;
use crate::core::context::TaskContext;
use crate::core::mux::Handler;
use crate::core::syncer::{SyncFn, SyncRequest, SyncSender};
use crate::error::{ForgeError, ForgeResult};
use crate::task::{Task, TaskMessage, time_after};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Decides whether an error counts toward the retry limit.
pub type IsFailureFn = Arc<dyn Fn(&ForgeError) -> bool + Send + Sync>;

/// Computes the delay before the next attempt from the retry count so far,
/// the error and the task.
pub type RetryDelayFn = Arc<dyn Fn(u32, &ForgeError, &Task) -> Duration + Send + Sync>;

/// Notification sent when a dequeued task starts executing.
#[derive(Debug, Clone)]
pub struct WorkerStarted {
    pub msg: TaskMessage,
    pub started: SystemTime,
    pub deadline: SystemTime,
}

/// Lifecycle of one dequeued task, in the order it happened.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started(WorkerStarted),
    Finished(TaskMessage),
}

/// Everything the processor needs from the engine.
pub struct ProcessorParams {
    pub broker: Arc<dyn Broker>,
    pub handler: Arc<dyn Handler>,
    /// Queue names in dequeue priority order
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub is_failure: IsFailureFn,
    pub retry_delay: RetryDelayFn,
    pub sync_tx: SyncSender,
    pub cancelations: Arc<Cancelations>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    /// Grace period given to in-flight handlers at shutdown
    pub shutdown_timeout: Duration,
    /// Sleep between polls while every queue is empty
    pub poll_backoff: Duration,
}

struct Inner {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn Handler>,
    queues: Vec<String>,
    concurrency: usize,
    is_failure: IsFailureFn,
    retry_delay: RetryDelayFn,
    sync_tx: SyncSender,
    cancelations: Arc<Cancelations>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutdown_timeout: Duration,
    poll_backoff: Duration,

    sema: Arc<Semaphore>,
    quit: CancellationToken,
    abort: CancellationToken,
    stop_once: Once,
}

/// Bounded-concurrency worker pool.
pub struct Processor {
    inner: Arc<Inner>,
    main_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    pub fn new(params: ProcessorParams) -> Self {
        let concurrency = params.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                broker: params.broker,
                handler: params.handler,
                queues: params.queues,
                concurrency,
                is_failure: params.is_failure,
                retry_delay: params.retry_delay,
                sync_tx: params.sync_tx,
                cancelations: params.cancelations,
                events: params.events,
                shutdown_timeout: params.shutdown_timeout,
                poll_backoff: params.poll_backoff,
                sema: Arc::new(Semaphore::new(concurrency)),
                quit: CancellationToken::new(),
                abort: CancellationToken::new(),
                stop_once: Once::new(),
            }),
            main_loop: Mutex::new(None),
        }
    }

    /// Spawn the dequeue loop.
    pub fn start(&self) {
        let mut main_loop = self.main_loop.lock();
        if main_loop.is_some() {
            tracing::warn!("Processor already started");
            return;
        }
        let inner = Arc::clone(&self.inner);
        *main_loop = Some(tokio::spawn(inner.run()));
    }

    /// Stop dequeuing new tasks. In-flight tasks keep running. Idempotent.
    pub fn stop(&self) {
        self.inner.stop_once.call_once(|| {
            tracing::debug!("Processor shutting down...");
            self.inner.quit.cancel();
        });
    }

    /// Stop dequeuing and wait for in-flight tasks. Tasks still running
    /// after the shutdown timeout are requeued and abandoned.
    pub async fn shutdown(&self) {
        self.stop();

        let abort = self.inner.abort.clone();
        let grace = self.inner.shutdown_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            abort.cancel();
        });

        let main_loop = self.main_loop.lock().take();
        if let Some(join) = main_loop {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "Processor loop exited abnormally");
            }
        }

        tracing::info!("Waiting for all workers to finish...");
        // Holding every slot means every worker has run its cleanup.
        match self.inner.sema.acquire_many(self.inner.concurrency as u32).await {
            Ok(all) => drop(all),
            Err(e) => tracing::error!(error = %e, "Worker semaphore closed"),
        }
        timer.abort();
        tracing::info!("All workers have finished");
    }

    /// Number of free worker slots.
    pub fn available_slots(&self) -> usize {
        self.inner.sema.available_permits()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.quit.is_cancelled()
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        tracing::debug!(queues = ?self.queues, concurrency = self.concurrency, "Processor started");

        loop {
            let permit = tokio::select! {
                _ = self.quit.cancelled() => break,
                permit = Arc::clone(&self.sema).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if self.quit.is_cancelled() {
                break;
            }

            match self.broker.dequeue(&self.queues).await {
                Ok((msg, deadline)) => {
                    let _ = self.events.send(WorkerEvent::Started(WorkerStarted {
                        msg: msg.clone(),
                        started: SystemTime::now(),
                        deadline,
                    }));
                    tokio::spawn(Arc::clone(&self).exec(msg, deadline, permit));
                }
                Err(ForgeError::NoProcessableTask) => {
                    drop(permit);
                    tracing::trace!("All queues are empty");
                    tokio::select! {
                        _ = self.quit.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_backoff) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Dequeue error");
                }
            }
        }

        tracing::debug!("Processor stopped");
    }

    async fn exec(self: Arc<Self>, msg: TaskMessage, deadline: SystemTime, permit: OwnedSemaphorePermit) {
        let ctx = TaskContext::for_message(&msg, deadline);
        self.cancelations.add(msg.id.clone(), ctx.token());
        let _cleanup = ExecCleanup {
            ctx: ctx.clone(),
            msg: Some(msg.clone()),
            cancelations: Arc::clone(&self.cancelations),
            events: self.events.clone(),
            _permit: permit,
        };

        let task = msg.to_task();

        if let Some(err) = ctx.err() {
            tracing::debug!(task_id = %msg.id, error = %err, "Task context done before execution");
            self.retry_or_archive(&ctx, &msg, &task, &err).await;
            return;
        }

        let handler = Arc::clone(&self.handler);
        let handler_ctx = ctx.clone();
        let handler_task = task.clone();
        let mut result =
            tokio::spawn(async move { handler.process_task(&handler_ctx, &handler_task).await });

        tokio::select! {
            _ = self.abort.cancelled() => {
                tracing::warn!(task_id = %msg.id, "Quitting worker, requeueing task");
                self.requeue(&msg).await;
            }
            err = ctx.done() => {
                tracing::debug!(task_id = %msg.id, error = %err, "Task context done during execution");
                self.retry_or_archive(&ctx, &msg, &task, &err).await;
            }
            res = &mut result => match handler_outcome(res) {
                Ok(()) => self.mark_as_done(&ctx, &msg).await,
                Err(err) => self.retry_or_archive(&ctx, &msg, &task, &err).await,
            },
        }
    }

    async fn requeue(&self, msg: &TaskMessage) {
        match self.broker.requeue(msg).await {
            Ok(()) => tracing::info!(task_id = %msg.id, queue = %msg.queue, "Pushed task back to queue"),
            Err(e) => tracing::error!(task_id = %msg.id, error = %e, "Could not push task back to queue"),
        }
    }

    async fn mark_as_done(&self, ctx: &TaskContext, msg: &TaskMessage) {
        if let Err(e) = self.broker.done(msg).await {
            let err_msg = format!(
                "Could not remove task id={} type={:?} from active queue: {}",
                msg.id, msg.type_name, e
            );
            tracing::warn!("{err_msg}; will retry syncing");
            let broker = Arc::clone(&self.broker);
            let msg = msg.clone();
            self.sync(
                Box::new(move || {
                    let broker = Arc::clone(&broker);
                    let msg = msg.clone();
                    async move { broker.done(&msg).await }.boxed()
                }),
                err_msg,
                ctx.deadline(),
            );
        }
    }

    async fn retry_or_archive(
        &self,
        ctx: &TaskContext,
        msg: &TaskMessage,
        task: &Task,
        err: &ForgeError,
    ) {
        let is_failure = (self.is_failure)(err);
        if is_failure && msg.retried >= msg.retry {
            tracing::warn!(task_id = %msg.id, retried = msg.retried, error = %err, "Retry exhausted, archiving task");
            self.archive(ctx, msg, err).await;
        } else {
            self.retry(ctx, msg, task, err, is_failure).await;
        }
    }

    async fn retry(
        &self,
        ctx: &TaskContext,
        msg: &TaskMessage,
        task: &Task,
        err: &ForgeError,
        is_failure: bool,
    ) {
        let delay = (self.retry_delay)(msg.retried, err, task);
        let retry_at = time_after(SystemTime::now(), delay);
        let err_msg = err.to_string();
        tracing::debug!(task_id = %msg.id, ?delay, is_failure, error = %err_msg, "Retrying task");

        if let Err(e) = self.broker.retry(msg, retry_at, &err_msg, is_failure).await {
            let sync_msg = format!("Could not move task id={} from active to retry: {}", msg.id, e);
            tracing::error!("{sync_msg}");
            let broker = Arc::clone(&self.broker);
            let msg = msg.clone();
            self.sync(
                Box::new(move || {
                    let broker = Arc::clone(&broker);
                    let msg = msg.clone();
                    let err_msg = err_msg.clone();
                    async move { broker.retry(&msg, retry_at, &err_msg, is_failure).await }.boxed()
                }),
                sync_msg,
                ctx.deadline(),
            );
        }
    }

    async fn archive(&self, ctx: &TaskContext, msg: &TaskMessage, err: &ForgeError) {
        let err_msg = err.to_string();
        if let Err(e) = self.broker.archive(msg, &err_msg).await {
            let sync_msg = format!("Could not move task id={} from active to archived: {}", msg.id, e);
            tracing::error!("{sync_msg}");
            let broker = Arc::clone(&self.broker);
            let msg = msg.clone();
            self.sync(
                Box::new(move || {
                    let broker = Arc::clone(&broker);
                    let msg = msg.clone();
                    let err_msg = err_msg.clone();
                    async move { broker.archive(&msg, &err_msg).await }.boxed()
                }),
                sync_msg,
                ctx.deadline(),
            );
        }
    }

    fn sync(&self, op: SyncFn, err_msg: String, deadline: SystemTime) {
        if self.sync_tx.send(SyncRequest::new(op, err_msg, deadline)).is_err() {
            tracing::error!("Syncer is gone, dropping sync request");
        }
    }
}

/// Per-task cleanup, run on every exit path including panics.
struct ExecCleanup {
    ctx: TaskContext,
    msg: Option<TaskMessage>,
    cancelations: Arc<Cancelations>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    // Dropped after `drop` returns, so the slot is released last.
    _permit: OwnedSemaphorePermit,
}

impl Drop for ExecCleanup {
    fn drop(&mut self) {
        self.ctx.cancel();
        self.cancelations.delete(self.ctx.task_id());
        if let Some(msg) = self.msg.take() {
            let _ = self.events.send(WorkerEvent::Finished(msg));
        }
    }
}

fn handler_outcome(res: Result<ForgeResult<()>, JoinError>) -> ForgeResult<()> {
    match res {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ForgeError::Panicked {
            message: panic_message(e.into_panic()),
        }),
        Err(e) => Err(ForgeError::Panicked {
            message: e.to_string(),
        }),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
