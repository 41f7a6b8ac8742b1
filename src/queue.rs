//! Handler Queue: the bounded hand-off between callers submitting
//! operations and the worker pool draining them.
//!
//! The original implementation wakes workers blocked in `poll()` by writing
//! a byte to a pipe alongside an in-memory deque. Since the worker loop
//! here already lives on the tokio reactor, that wakeup plumbing collapses
//! into a bounded `tokio::sync::mpsc` channel — the wire-level behavior it
//! replaces was never observable outside the process. The same queue type
//! backs both the intake Handler Queue and the Continue Queue used to wake
//! paused PUT operations once more data has arrived.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{Error, ErrorKind};

#[derive(Default)]
struct QueueStats {
    produced: AtomicU64,
    consumed: AtomicU64,
    rejected: AtomicU64,
}

/// Multi-producer multi-consumer queue of items `T`, bounded at
/// `max_pending` the way the original's pipe-backed queue was bounded by
/// pipe buffer capacity.
pub struct HandlerQueue<T> {
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    stats: QueueStats,
    shutdown: AtomicBool,
}

impl<T: Send + 'static> HandlerQueue<T> {
    pub fn new(max_pending: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(max_pending.max(1));
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            stats: QueueStats::default(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Enqueues an item, waiting until either a slot frees up or `expiry`
    /// passes (matching the original's `wait_until(handler_expiry, ...)`).
    pub async fn produce(&self, item: T, expiry: Instant) -> Result<(), Error> {
        let now = Instant::now();
        let budget = expiry.saturating_duration_since(now);
        match timeout(budget, self.tx.send(item)).await {
            Ok(Ok(())) => {
                self.stats.produced.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(Error::new(ErrorKind::InternalError, "queue shut down")),
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::new(
                    ErrorKind::OperationExpired,
                    "operation expired while waiting for worker",
                ))
            }
        }
    }

    /// Enqueues an item immediately, with no expiry; used for the Continue
    /// Queue where a paused operation's own expiry is already tracked by
    /// the worker that owns it.
    pub async fn produce_now(&self, item: T) -> Result<(), Error> {
        self.produce(item, Instant::now() + Duration::from_secs(3600))
            .await
    }

    /// Blocks until an item is available or `dur` elapses.
    pub async fn consume(&self, dur: Duration) -> Option<T> {
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let mut rx = self.rx.lock().await;
        match timeout(dur, rx.recv()).await {
            Ok(Some(item)) => {
                self.stats.consumed.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            _ => None,
        }
    }

    /// Non-blocking drain of one item, if any is immediately ready.
    pub async fn try_consume(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        match rx.try_recv() {
            Ok(item) => {
                self.stats.consumed.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(_) => None,
        }
    }

    /// Signals all waiting consumers to return `None` instead of blocking
    /// further, the async equivalent of the original's `m_shutdown` flag
    /// plus `notify_all`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn monitoring_json(&self) -> String {
        let produced = self.stats.produced.load(Ordering::Relaxed);
        let consumed = self.stats.consumed.load(Ordering::Relaxed);
        let rejected = self.stats.rejected.load(Ordering::Relaxed);
        format!(
            "{{\"produced\":{produced},\"consumed\":{consumed},\"pending\":{},\"rejected\":{rejected}}}",
            produced.saturating_sub(consumed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produce_then_consume_roundtrips() {
        let q: Arc<HandlerQueue<u32>> = HandlerQueue::new(4);
        q.produce(7, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        let got = q.consume(Duration::from_millis(100)).await;
        assert_eq!(got, Some(7));
        assert_eq!(q.stats.produced.load(Ordering::Relaxed), 1);
        assert_eq!(q.stats.consumed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn consume_times_out_when_empty() {
        let q: Arc<HandlerQueue<u32>> = HandlerQueue::new(4);
        let got = q.consume(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn try_consume_empty_is_none() {
        let q: Arc<HandlerQueue<u32>> = HandlerQueue::new(4);
        assert!(q.try_consume().await.is_none());
    }

    #[tokio::test]
    async fn produce_rejects_past_expiry() {
        let q: Arc<HandlerQueue<u32>> = HandlerQueue::new(1);
        let expiry = Instant::now() - Duration::from_millis(1);
        let err = q.produce(7, expiry).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OperationExpired);
    }

    #[tokio::test]
    async fn monitoring_json_reflects_counts() {
        let q: Arc<HandlerQueue<u32>> = HandlerQueue::new(4);
        q.produce(7, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        let json = q.monitoring_json();
        assert!(json.contains("\"produced\":1"));
    }

    #[tokio::test]
    async fn shutdown_makes_consume_return_none_immediately() {
        let q: Arc<HandlerQueue<u32>> = HandlerQueue::new(4);
        q.shutdown();
        assert!(q.is_shutdown());
        let got = q.consume(Duration::from_millis(500)).await;
        assert!(got.is_none());
    }
}
