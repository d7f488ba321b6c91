//! Task-type dispatch.
//!
//! [`ServeMux`] maps task type names to [`Handler`]s. Lookup prefers an exact
//! match on the type name, then the longest registered pattern that is a
//! prefix of it. Unrouted tasks get a handler that always fails with
//! [`ForgeError::HandlerNotFound`].
//!
//! # Examples
//!
//! ```rust
//! use taskforge::prelude::*;
//!
//! let mux = ServeMux::new();
//! mux.handle_func("email:", |_ctx, task| async move {
//!     tracing::info!("sending {} bytes", task.payload().len());
//!     Ok(())
//! });
//! mux.use_middleware(|next| next);
//! ```

use crate::core::context::TaskContext;
use crate::error::{ForgeError, ForgeResult};
use crate::task::Task;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Business logic executed for a task.
///
/// Handlers are invoked concurrently for unrelated tasks and should return
/// promptly once `ctx` is done.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one task.
    async fn process_task(&self, ctx: &TaskContext, task: &Task) -> ForgeResult<()>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ForgeResult<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ForgeResult<()>> + Send + 'static,
{
    async fn process_task(&self, ctx: &TaskContext, task: &Task) -> ForgeResult<()> {
        (self.0)(ctx.clone(), task.clone()).await
    }
}

/// Wraps a handler into a new handler.
pub type Middleware = Arc<dyn Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync>;

/// Handler returned when no pattern matches a task type.
pub struct NotFoundHandler;

#[async_trait]
impl Handler for NotFoundHandler {
    async fn process_task(&self, _ctx: &TaskContext, task: &Task) -> ForgeResult<()> {
        Err(ForgeError::HandlerNotFound {
            task_type: task.type_name().to_string(),
        })
    }
}

#[derive(Clone)]
struct MuxEntry {
    handler: Arc<dyn Handler>,
    pattern: String,
}

#[derive(Default)]
struct MuxState {
    exact: HashMap<String, MuxEntry>,
    /// Entries sorted by descending pattern length.
    sorted: Vec<MuxEntry>,
    middlewares: Vec<Middleware>,
}

/// Task router with middleware support.
#[derive(Default)]
pub struct ServeMux {
    state: RwLock<MuxState>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is blank or already registered.
    pub fn handle(&self, pattern: impl Into<String>, handler: Arc<dyn Handler>) {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            panic!("taskforge: invalid pattern {pattern:?}");
        }

        let mut state = self.state.write();
        if state.exact.contains_key(&pattern) {
            panic!("taskforge: multiple registrations for {pattern}");
        }

        let entry = MuxEntry {
            handler,
            pattern: pattern.clone(),
        };
        state.exact.insert(pattern.clone(), entry.clone());

        // Insert after every entry at least as long, keeping the sort stable.
        let index = state
            .sorted
            .partition_point(|e| e.pattern.len() >= pattern.len());
        state.sorted.insert(index, entry);

        tracing::debug!(pattern = %pattern, "Registered task handler");
    }

    /// Register an async closure for `pattern`.
    ///
    /// # Panics
    ///
    /// Same conditions as [`ServeMux::handle`].
    pub fn handle_func<F, Fut>(&self, pattern: impl Into<String>, f: F)
    where
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ForgeResult<()>> + Send + 'static,
    {
        self.handle(pattern, Arc::new(handler_fn(f)));
    }

    /// Append a middleware. The last appended middleware is the outermost.
    pub fn use_middleware<M>(&self, middleware: M)
    where
        M: Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        self.state.write().middlewares.push(Arc::new(middleware));
    }

    /// Resolve the handler for `task`, wrapped in the middleware chain, and the
    /// pattern it was registered under (`""` when nothing matched).
    pub fn handler(&self, task: &Task) -> (Arc<dyn Handler>, String) {
        let state = self.state.read();

        let (mut handler, pattern) = match Self::lookup(&state, task.type_name()) {
            Some(entry) => (entry.handler.clone(), entry.pattern.clone()),
            None => (Arc::new(NotFoundHandler) as Arc<dyn Handler>, String::new()),
        };

        for middleware in state.middlewares.iter().rev() {
            handler = middleware(handler);
        }
        (handler, pattern)
    }

    fn lookup<'a>(state: &'a MuxState, type_name: &str) -> Option<&'a MuxEntry> {
        if let Some(entry) = state.exact.get(type_name) {
            return Some(entry);
        }
        state
            .sorted
            .iter()
            .find(|e| type_name.starts_with(e.pattern.as_str()))
    }

    /// Registered patterns, longest first.
    pub fn patterns(&self) -> Vec<String> {
        self.state
            .read()
            .sorted
            .iter()
            .map(|e| e.pattern.clone())
            .collect()
    }
}

#[async_trait]
impl Handler for ServeMux {
    async fn process_task(&self, ctx: &TaskContext, task: &Task) -> ForgeResult<()> {
        let (handler, _) = self.handler(task);
        handler.process_task(ctx, task).await
    }
}
