//! Best-effort retry of store writes that failed.
//!
//! The processor hands the syncer operations such as "mark task done" whose
//! first attempt failed. The syncer retries them every interval and drops a
//! request once its deadline has passed. Requests still failing at shutdown
//! get one last attempt and are then lost.

use crate::core::ServiceHandle;
use crate::error::ForgeResult;
use futures::future::BoxFuture;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Re-runnable store operation.
pub type SyncFn = Box<dyn FnMut() -> BoxFuture<'static, ForgeResult<()>> + Send>;

/// A failed store operation waiting to be retried.
pub struct SyncRequest {
    op: SyncFn,
    err_msg: String,
    deadline: SystemTime,
}

impl SyncRequest {
    /// Create a request; it is dropped once `deadline` has passed.
    pub fn new(op: SyncFn, err_msg: impl Into<String>, deadline: SystemTime) -> Self {
        Self {
            op,
            err_msg: err_msg.into(),
            deadline,
        }
    }

    pub fn err_msg(&self) -> &str {
        &self.err_msg
    }

    pub fn deadline(&self) -> SystemTime {
        self.deadline
    }

    async fn attempt(&mut self) -> ForgeResult<()> {
        (self.op)().await
    }
}

impl std::fmt::Debug for SyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRequest")
            .field("err_msg", &self.err_msg)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Sending half used by the processor.
pub type SyncSender = mpsc::UnboundedSender<SyncRequest>;

/// The syncer component.
pub struct Syncer {
    requests_rx: mpsc::UnboundedReceiver<SyncRequest>,
    interval: Duration,
}

impl Syncer {
    /// Create a syncer and the channel feeding it.
    pub fn new(interval: Duration) -> (Self, SyncSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                requests_rx: rx,
                interval,
            },
            tx,
        )
    }

    /// Spawn the syncer loop.
    pub fn start(self) -> ServiceHandle {
        let done = CancellationToken::new();
        let stop = done.clone();
        let join = tokio::spawn(self.run(stop));
        ServiceHandle::new("syncer", done, join)
    }

    async fn run(mut self, stop: CancellationToken) {
        tracing::debug!("Syncer started");

        let mut requests: Vec<SyncRequest> = Vec::new();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut channel_open = true;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                req = self.requests_rx.recv(), if channel_open => match req {
                    Some(req) => requests.push(req),
                    None => channel_open = false,
                },
                _ = ticker.tick() => {
                    requests = retry_pending(requests).await;
                }
            }
        }

        // One last attempt over everything buffered, then give up.
        while let Ok(req) = self.requests_rx.try_recv() {
            requests.push(req);
        }
        for mut req in requests {
            if let Err(e) = req.attempt().await {
                tracing::error!(error = %e, "{}", req.err_msg);
            }
        }

        tracing::debug!("Syncer stopped");
    }
}

/// Attempt every request in order; keep the ones that failed and are still
/// within their deadline.
async fn retry_pending(requests: Vec<SyncRequest>) -> Vec<SyncRequest> {
    let mut remaining = Vec::with_capacity(requests.len());
    for mut req in requests {
        if req.deadline < SystemTime::now() {
            tracing::debug!(deadline = ?req.deadline, "Dropping stale sync request: {}", req.err_msg);
            continue;
        }
        if let Err(e) = req.attempt().await {
            tracing::debug!(error = %e, "Sync retry failed: {}", req.err_msg);
            remaining.push(req);
        }
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ForgeError};
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Operation that fails `failures` times, then succeeds; counts attempts.
    fn flaky_op(failures: usize, attempts: Arc<AtomicUsize>) -> SyncFn {
        Box::new(move || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(ForgeError::op("test.sync", ErrorCode::Internal, "store down"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    fn far_future() -> SystemTime {
        SystemTime::now() + Duration::from_secs(3600)
    }

    #[tokio::test]
    async fn test_failed_request_is_retried_until_success() {
        let (syncer, tx) = Syncer::new(Duration::from_millis(20));
        let handle = syncer.start();

        let attempts = Arc::new(AtomicUsize::new(0));
        tx.send(SyncRequest::new(flaky_op(2, attempts.clone()), "mark done", far_future()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        handle.shutdown().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_expired_request_is_dropped() {
        let (syncer, tx) = Syncer::new(Duration::from_millis(20));
        let handle = syncer.start();

        let stale = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));
        tx.send(SyncRequest::new(
            flaky_op(usize::MAX, stale.clone()),
            "stale",
            SystemTime::now() - Duration::from_secs(1),
        ))
        .unwrap();
        tx.send(SyncRequest::new(flaky_op(usize::MAX, live.clone()), "live", far_future()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(stale.load(Ordering::SeqCst), 0);
        assert!(live.load(Ordering::SeqCst) >= 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_is_dropped_once_its_deadline_passes() {
        let (syncer, tx) = Syncer::new(Duration::from_millis(20));
        let handle = syncer.start();

        let attempts = Arc::new(AtomicUsize::new(0));
        tx.send(SyncRequest::new(
            flaky_op(usize::MAX, attempts.clone()),
            "short-lived",
            SystemTime::now() + Duration::from_millis(100),
        ))
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let retried = attempts.load(Ordering::SeqCst);
        assert!(retried >= 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), retried);

        // Dropped requests are not part of the final attempt either.
        handle.shutdown().await;
        assert_eq!(attempts.load(Ordering::SeqCst), retried);
    }

    #[tokio::test]
    async fn test_shutdown_makes_one_final_attempt() {
        let (syncer, tx) = Syncer::new(Duration::from_secs(3600));
        let handle = syncer.start();

        let attempts = Arc::new(AtomicUsize::new(0));
        tx.send(SyncRequest::new(flaky_op(usize::MAX, attempts.clone()), "never", far_future()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.shutdown().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_pending_keeps_order_and_failures() {
        let ok = Arc::new(AtomicUsize::new(0));
        let bad = Arc::new(AtomicUsize::new(0));
        let requests = vec![
            SyncRequest::new(flaky_op(0, ok.clone()), "ok", far_future()),
            SyncRequest::new(flaky_op(usize::MAX, bad.clone()), "bad", far_future()),
        ];

        let remaining = retry_pending(requests).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].err_msg(), "bad");
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(bad.load(Ordering::SeqCst), 1);
    }
}
