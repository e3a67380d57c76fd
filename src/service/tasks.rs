//! Repeating background work.
//!
//! A [`Repeating`] task runs a step on a fixed interval as a client task, so
//! it ends with the client. [`Heartbeat`] is a service built on it that
//! announces the host on the relay while it is Alive.

use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::opcode::OpCode;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::client::Client;
use crate::protocol::context::ClientHandle;
use crate::protocol::registry::{tags, Handler, ListenerKey};
use crate::service::Service;

/// Longest interval a repeating task accepts (40 days)
pub const MAX_INTERVAL: Duration = Duration::from_secs(3_456_000);

type Step = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn boxed<F, Fut>(f: F) -> Step
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// A step run every `interval`, optionally a fixed number of times.
///
/// The first iteration runs as soon as the task starts. A failing step ends
/// the loop and marks the task failed. Hooks run before the first iteration
/// and after the last one; their errors are logged and ignored.
#[derive(Clone)]
pub struct Repeating {
    interval: Duration,
    count: Option<u64>,
    step: Step,
    before: Option<Step>,
    after: Option<Step>,
    status: Arc<Status>,
}

struct Status {
    current: AtomicU64,
    stop_next: AtomicBool,
    cancelling: AtomicBool,
    failed: AtomicBool,
    running: watch::Sender<bool>,
    cancel: Mutex<CancellationToken>,
}

/// Marks the task stopped however its future ends, including client
/// shutdown dropping it.
struct RunningGuard(Arc<Status>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.send_replace(false);
    }
}

impl Repeating {
    pub fn new<F, Fut>(interval: Duration, step: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (running, _) = watch::channel(false);
        Self {
            interval,
            count: None,
            step: boxed(step),
            before: None,
            after: None,
            status: Arc::new(Status {
                current: AtomicU64::new(0),
                stop_next: AtomicBool::new(false),
                cancelling: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                running,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Stop after `count` iterations instead of running forever.
    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn before<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before = Some(boxed(hook));
        self
    }

    /// Runs once the loop ends on its own, is stopped, fails or is
    /// cancelled. Client shutdown drops the loop without running it.
    pub fn after<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after = Some(boxed(hook));
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Iterations completed by the current or last run.
    pub fn current_loop(&self) -> u64 {
        self.status.current.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        *self.status.running.borrow()
    }

    pub fn failed(&self) -> bool {
        self.status.failed.load(Ordering::SeqCst)
    }

    /// True while a cancelled loop is winding down, hooks included.
    pub fn is_being_cancelled(&self) -> bool {
        self.status.cancelling.load(Ordering::SeqCst)
    }

    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(ProtocolError::ConfigError(
                "repeating interval must be greater than zero".into(),
            ));
        }
        if self.interval > MAX_INTERVAL {
            return Err(ProtocolError::ConfigError(format!(
                "repeating interval exceeds {} seconds",
                MAX_INTERVAL.as_secs()
            )));
        }
        if self.count == Some(0) {
            return Err(ProtocolError::ConfigError(
                "repeating count must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Launch the loop as a task of `client`. Fails if it is already running.
    pub fn start(&self, client: &Client) -> Result<()> {
        self.validate()?;
        if self.status.running.send_replace(true) {
            return Err(ProtocolError::InvalidState {
                expected: "stopped",
                found: "running",
            });
        }

        let token = CancellationToken::new();
        *self.status.cancel.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        self.status.current.store(0, Ordering::SeqCst);
        self.status.stop_next.store(false, Ordering::SeqCst);
        self.status.cancelling.store(false, Ordering::SeqCst);
        self.status.failed.store(false, Ordering::SeqCst);

        let guard = RunningGuard(Arc::clone(&self.status));
        client.spawn("repeating", self.clone().run(token, guard));
        Ok(())
    }

    /// Let the current iteration finish, then end the loop.
    pub fn stop(&self) {
        if self.is_running() {
            self.status.stop_next.store(true, Ordering::SeqCst);
        }
    }

    /// End the loop at its next await point.
    pub fn cancel(&self) {
        if self.is_running() {
            self.status
                .cancel
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .cancel();
        }
    }

    /// Cancel the loop and start it again once it has wound down.
    pub fn restart(&self, client: &Client) {
        self.cancel();
        let this = self.clone();
        let handle = client.handle();
        let mut running = self.status.running.subscribe();
        client.spawn("repeating-restart", async move {
            if running.wait_for(|running| !*running).await.is_err() {
                return;
            }
            let Ok(client) = handle.upgrade() else {
                return;
            };
            if let Err(e) = this.start(&client) {
                warn!(error = %e, "failed to restart repeating task");
            }
        });
    }

    async fn run(self, token: CancellationToken, _guard: RunningGuard) {
        let status = &self.status;
        if let Some(before) = &self.before {
            if let Err(e) = before().await {
                warn!(error = %e, "before hook failed");
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    status.cancelling.store(true, Ordering::SeqCst);
                    break;
                }
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    status.cancelling.store(true, Ordering::SeqCst);
                    break;
                }
                outcome = (self.step)() => outcome,
            };
            if let Err(e) = outcome {
                status.failed.store(true, Ordering::SeqCst);
                warn!(iteration = status.current.load(Ordering::SeqCst), error = %e, "repeating task failed");
                break;
            }

            let done = status.current.fetch_add(1, Ordering::SeqCst) + 1;
            if status.stop_next.load(Ordering::SeqCst) || Some(done) == self.count {
                break;
            }
        }

        if let Some(after) = &self.after {
            if let Err(e) = after().await {
                warn!(error = %e, "after hook failed");
            }
        }
        status.cancelling.store(false, Ordering::SeqCst);
        debug!(iterations = status.current.load(Ordering::SeqCst), "repeating task ended");
    }
}

impl fmt::Debug for Repeating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repeating")
            .field("interval", &self.interval)
            .field("count", &self.count)
            .field("current_loop", &self.current_loop())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Broadcasts a Heartbeat packet every `interval` once the client is Alive.
/// Each heartbeat expires after one interval.
pub struct Heartbeat {
    handle: ClientHandle,
    task: Repeating,
}

impl Heartbeat {
    pub fn new(handle: ClientHandle, interval: Duration) -> Self {
        let ttl = interval.as_secs().max(1);
        let task = Repeating::new(interval, move || async move {
            handle
                .send_packet(Packet::builder(OpCode::Heartbeat).ttl(ttl))
                .await
                .map(|_| ())
        });
        Self { handle, task }
    }

    /// Service factory for [`ClientBuilder::service`](crate::ClientBuilder::service).
    pub fn factory(interval: Duration) -> impl FnOnce(ClientHandle) -> Arc<dyn Service> + Send {
        move |handle| Arc::new(Heartbeat::new(handle, interval)) as Arc<dyn Service>
    }

    pub fn task(&self) -> &Repeating {
        &self.task
    }
}

impl Service for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn listeners(self: Arc<Self>) -> Vec<(ListenerKey, Handler)> {
        let on_alive = Handler::signal(move || {
            let this = Arc::clone(&self);
            async move {
                let client = this.handle.upgrade()?;
                this.task.start(&client)
            }
        });
        vec![(ListenerKey::tag(tags::ALIVE), on_alive)]
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::transport::memory::MemoryRelay;

    fn client(relay: &MemoryRelay, host: &str) -> Client {
        Client::builder(relay.endpoint())
            .hostname(host)
            .discovery(DiscoveryConfig {
                max_steps: 2,
                ..DiscoveryConfig::default()
            })
            .build()
            .unwrap()
    }

    fn ticking() -> (Arc<AtomicU64>, Repeating) {
        let hits = Arc::new(AtomicU64::new(0));
        let inner = Arc::clone(&hits);
        let task = Repeating::new(Duration::from_secs(1), move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        (hits, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_count_iterations() {
        let relay = MemoryRelay::new();
        let alpha = client(&relay, "alpha");
        let (hits, task) = ticking();
        let task = task.count(3);

        task.start(&alpha).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(task.current_loop(), 3);
        assert!(!task.is_running());
        assert!(!task.failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_shutdown_stops_loop() {
        let relay = MemoryRelay::new();
        let alpha = client(&relay, "alpha");
        alpha.start().await.unwrap();
        let (hits, task) = ticking();

        task.start(&alpha).unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        alpha.shutdown().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_runs_hooks_once() {
        let relay = MemoryRelay::new();
        let alpha = client(&relay, "alpha");
        let befores = Arc::new(AtomicU64::new(0));
        let afters = Arc::new(AtomicU64::new(0));
        let (hits, task) = ticking();
        let task = {
            let befores = Arc::clone(&befores);
            let afters = Arc::clone(&afters);
            task.before(move || {
                let befores = Arc::clone(&befores);
                async move {
                    befores.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .after(move || {
                let afters = Arc::clone(&afters);
                async move {
                    afters.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        task.start(&alpha).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(befores.load(Ordering::SeqCst), 1);
        assert_eq!(afters.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_step_ends_loop() {
        let relay = MemoryRelay::new();
        let alpha = client(&relay, "alpha");
        let task = Repeating::new(Duration::from_secs(1), || async {
            Err(ProtocolError::Custom("nope".into()))
        });

        task.start(&alpha).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(task.failed());
        assert_eq!(task.current_loop(), 0);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_restart() {
        let relay = MemoryRelay::new();
        let alpha = client(&relay, "alpha");
        let (hits, task) = ticking();

        task.start(&alpha).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        task.restart(&alpha);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(task.is_running());
        assert_eq!(task.current_loop(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 5);

        task.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!task.is_running());
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_bad_settings_and_double_start() {
        let relay = MemoryRelay::new();
        let alpha = client(&relay, "alpha");

        let zero = Repeating::new(Duration::ZERO, || async { Ok(()) });
        assert!(matches!(zero.start(&alpha), Err(ProtocolError::ConfigError(_))));
        let huge = Repeating::new(MAX_INTERVAL * 2, || async { Ok(()) });
        assert!(matches!(huge.start(&alpha), Err(ProtocolError::ConfigError(_))));
        let never = Repeating::new(Duration::from_secs(1), || async { Ok(()) }).count(0);
        assert!(matches!(never.start(&alpha), Err(ProtocolError::ConfigError(_))));

        let (_, task) = ticking();
        task.start(&alpha).unwrap();
        assert!(matches!(
            task.start(&alpha),
            Err(ProtocolError::InvalidState { found: "running", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_broadcast_while_alive() {
        let relay = MemoryRelay::new();
        let alpha = Client::builder(relay.endpoint())
            .hostname("alpha")
            .discovery(DiscoveryConfig {
                max_steps: 2,
                ..DiscoveryConfig::default()
            })
            .service(Heartbeat::factory(Duration::from_secs(5)))
            .build()
            .unwrap();
        let beta = client(&relay, "beta");

        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let beats = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&beats);
        beta.listeners()
            .register(
                OpCode::Heartbeat,
                Handler::packet(move |packet: Packet| {
                    let seen = Arc::clone(&seen);
                    async move {
                        assert_eq!(packet.author(), "alpha");
                        assert_eq!(packet.ttl(), Some(5));
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(beats.load(Ordering::SeqCst), 2);

        alpha.shutdown().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(beats.load(Ordering::SeqCst), 2);
    }
}
