//! Reconnecting watch over a key prefix.
//!
//! A single [`KvStore::watch`] call returns one event or fails when the
//! long-poll connection drops. [`Watcher`] turns that into a long-lived,
//! ordered stream: after every event it re-polls from the next index, and
//! after every failure it backs off and re-polls "from now". Events that
//! happen during a reconnect gap are lost; consumers re-derive state from the
//! store instead of trusting the stream to be complete.
//!
//! The stream ends only when cancelled: the consumer drops or closes the
//! [`WatchStream`], or the shared shutdown signal flips to `true`. Either way
//! the in-flight long-poll future is dropped, which aborts the request.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{KvStore, WatchEvent};

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on the delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0) applied symmetrically around the delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        let jittered = delay + delay * self.jitter * unit_noise();
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Pseudo-random value in [-1.0, 1.0] from the clock's sub-second nanos.
fn unit_noise() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (f64::from(nanos) / 1_000_000_000.0) * 2.0 - 1.0
}

/// Factory for reconnecting watch streams.
pub struct Watcher {
    store: Arc<dyn KvStore>,
    backoff: BackoffPolicy,
    shutdown: watch::Receiver<bool>,
}

impl Watcher {
    /// Create a watcher. Every stream it opens stops when `shutdown` becomes `true`.
    pub fn new(store: Arc<dyn KvStore>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::default(),
            shutdown,
        }
    }

    /// Override the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start watching `prefix`.
    pub fn watch(&self, prefix: &str, recursive: bool) -> WatchStream {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(run_watch(
            Arc::clone(&self.store),
            prefix.to_string(),
            recursive,
            self.backoff.clone(),
            self.shutdown.clone(),
            tx,
        ));
        WatchStream { rx, task }
    }
}

/// Consumer side of a watch. Dropping it cancels the watch.
pub struct WatchStream {
    rx: mpsc::Receiver<WatchEvent>,
    task: JoinHandle<()>,
}

impl WatchStream {
    /// Next change notification, or `None` once cancelled.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Cancel the watch, aborting any in-flight long-poll.
    pub fn close(&mut self) {
        self.rx.close();
        self.task.abort();
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolves once the shutdown flag is `true`. Never resolves if the sender
/// goes away without signalling.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_watch(
    store: Arc<dyn KvStore>,
    prefix: String,
    recursive: bool,
    backoff: BackoffPolicy,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::Sender<WatchEvent>,
) {
    info!(%prefix, recursive, "watch started");
    let mut attempt = 0u32;
    let mut wait_index: Option<u64> = None;

    loop {
        let result = tokio::select! {
            result = store.watch(&prefix, wait_index, recursive) => result,
            _ = tx.closed() => break,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        match result {
            Ok(event) => {
                attempt = 0;
                wait_index = Some(event.node.modified_index + 1);
                debug!(%prefix, action = %event.action, key = %event.node.key, "watch event");
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                wait_index = None;
                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(%prefix, error = %e, attempt, delay_ms = delay.as_millis() as u64, "watch ended, reconnecting");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tx.closed() => break,
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        }
    }

    info!(%prefix, "watch stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::memory::MemoryStore;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_millis(300) && d <= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn test_events_forwarded_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (_tx, rx) = watch::channel(false);
        let watcher = Watcher::new(store.clone(), rx).with_backoff(fast_backoff());
        let mut stream = watcher.watch("/apps", true);

        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..3 {
            store.set(&format!("/apps/a/c{i}/manifest"), "{}").await.unwrap();
        }

        for i in 0..3 {
            let event = timeout(Duration::from_secs(1), stream.next()).await.unwrap().unwrap();
            assert_eq!(event.node.key, format!("/apps/a/c{i}/manifest"));
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_disconnect() {
        let store = Arc::new(MemoryStore::new());
        let (_tx, rx) = watch::channel(false);
        let watcher = Watcher::new(store.clone(), rx).with_backoff(fast_backoff());
        let mut stream = watcher.watch("/apps", true);

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.disconnect_watchers();
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.set("/apps/a/c/manifest", "{}").await.unwrap();

        let event = timeout(Duration::from_secs(1), stream.next()).await.unwrap().unwrap();
        assert_eq!(event.node.key, "/apps/a/c/manifest");
    }

    #[tokio::test]
    async fn test_shutdown_ends_stream() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let watcher = Watcher::new(store, rx);
        let mut stream = watcher.watch("/apps", true);

        tx.send(true).unwrap();
        let next = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_close_aborts_inflight_watch() {
        let store = Arc::new(MemoryStore::new());
        let (_tx, rx) = watch::channel(false);
        let watcher = Watcher::new(store, rx);
        let mut stream = watcher.watch("/apps", true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        stream.close();
        assert!(stream.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stream.task.is_finished());
    }
}
