//! # Taskforge
//!
//! A background task processing engine for Rust applications.
//!
//! ## Features
//!
//! - **Bounded concurrency**: a fixed number of handlers run at once, no matter
//!   how fast tasks are dequeued
//! - **Routing**: a [`ServeMux`] maps task types to handlers by exact match or
//!   longest prefix, with middleware
//! - **Retries**: failed tasks are retried with a configurable backoff, then
//!   archived
//! - **Scheduling and uniqueness**: delayed tasks and duplicate suppression
//! - **Cancellation**: per-task deadlines and cross-process cancellation
//! - **Graceful Shutdown**: in-flight handlers get a grace period, then their
//!   tasks are requeued
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskforge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ForgeResult<()> {
//!     let config = ForgeConfig::development();
//!     config.logging.init();
//!
//!     let mux = ServeMux::new();
//!     mux.handle_func("email:send", |_ctx: TaskContext, task: Task| async move {
//!         tracing::info!(bytes = task.payload().len(), "Sending email");
//!         Ok(())
//!     });
//!
//!     let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
//!     let client = Client::from_config(broker.clone(), &config);
//!     client
//!         .enqueue(Task::new("email:send", b"hello".to_vec()), EnqueueOptions::new())
//!         .await?;
//!
//!     let engine = Engine::new(config, broker, Arc::new(mux));
//!     engine.start().await?;
//!     engine.wait_for_signal().await
//! }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod task;

pub mod prelude {
    pub use crate::broker::{Broker, InMemoryBroker};
    pub use crate::client::{Client, EnqueueOptions};
    pub use crate::config::*;
    pub use crate::core::{Engine, Handler, ServeMux, TaskContext, handler_fn};
    pub use crate::error::{ErrorCode, ForgeError, ForgeResult};
    pub use crate::task::{Task, TaskId, TaskInfo, TaskState};
    pub use async_trait::async_trait;
}

pub use crate::broker::{Broker, InMemoryBroker, QueueStats};
pub use crate::client::{Client, EnqueueOptions};
pub use crate::config::*;
pub use crate::core::{Engine, Handler, Middleware, ServeMux, TaskContext, handler_fn};
pub use crate::error::{ErrorCode, ForgeError, ForgeResult, OpError};
pub use crate::task::{ServerInfo, Task, TaskId, TaskInfo, TaskMessage, TaskState, WorkerInfo};
