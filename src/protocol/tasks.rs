//! Detached task management for one client.
//!
//! Handler fan-out and packet cleanup run as fire-and-forget tasks. They are
//! tracked so that shutdown can cancel every one of them at once.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::protocol::registry::HandlerFuture;
use crate::utils::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct TaskSpawner {
    tracker: TaskTracker,
    token: CancellationToken,
    metrics: Arc<Metrics>,
}

impl TaskSpawner {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            metrics,
        }
    }

    /// Spawn a task that stops at its next await point once the spawner is
    /// shut down.
    pub fn spawn_detached<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!(task = name, "task cancelled"),
                _ = fut => {}
            }
        });
    }

    /// Spawn one listener invocation. Errors and panics are logged and
    /// counted here and go no further.
    pub fn spawn_handler(&self, listener: String, fut: HandlerFuture) {
        let metrics = Arc::clone(&self.metrics);
        self.spawn_detached("listener", async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics.handler_failed();
                    warn!(%listener, error = %e, "listener failed");
                }
                Err(panic) => {
                    metrics.handler_failed();
                    error!(%listener, panic = panic_message(&*panic), "listener panicked");
                }
            }
        });
    }

    /// Cancel every tracked task. Does not wait for them, so it is safe to
    /// call from inside one.
    pub fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every task to finish. Only returns after [`shutdown`](Self::shutdown).
    pub async fn wait(&self) {
        self.tracker.wait().await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
