//! The in-process execution engine.
//!
//! - [`Processor`]: the worker pool running handlers under bounded concurrency
//! - [`Forwarder`]: promotes due scheduled tasks into pending queues
//! - [`Syncer`]: retries store writes that failed on the success path
//! - [`Recoverer`]: resolves tasks left active past their deadline
//! - [`Heartbeater`]: publishes server and worker telemetry
//! - [`ServeMux`]: routes task types to handlers
//! - [`Cancelations`]: triggers for canceling in-flight tasks
//!
//! [`Engine`] wires all of them to one broker.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod cancel;
pub mod context;
pub mod engine;
pub mod forwarder;
pub mod heartbeat;
pub mod mux;
pub mod processor;
pub mod recoverer;
pub mod syncer;

#[cfg(test)]
pub(crate) mod test_support;

pub use cancel::Cancelations;
pub use context::TaskContext;
pub use engine::Engine;
pub use forwarder::Forwarder;
pub use heartbeat::{Heartbeater, HeartbeaterParams};
pub use mux::{Handler, HandlerFn, Middleware, NotFoundHandler, ServeMux, handler_fn};
pub use processor::{IsFailureFn, Processor, ProcessorParams, RetryDelayFn, WorkerEvent, WorkerStarted};
pub use recoverer::Recoverer;
pub use syncer::{SyncRequest, SyncSender, Syncer};

/// Handle to a spawned background component.
///
/// [`ServiceHandle::shutdown`] signals the component and waits for its loop
/// to return, so it is a synchronous stop from the caller's point of view.
#[derive(Debug)]
pub struct ServiceHandle {
    name: &'static str,
    done: CancellationToken,
    join: JoinHandle<()>,
}

impl ServiceHandle {
    pub(crate) fn new(name: &'static str, done: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { name, done, join }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the component and wait for it to exit.
    pub async fn shutdown(self) {
        self.done.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(component = self.name, error = %e, "Component exited abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
