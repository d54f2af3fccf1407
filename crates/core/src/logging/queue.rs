//! Single-consumer FIFO between log callers and the event bus
//!
//! Direct emit-and-forget from mixed sync/async contexts delivers events out
//! of order. The queue decouples emission from delivery: `enqueue` stamps the
//! timestamp and appends to an unbounded FIFO from any thread, and one
//! background consumer drains it, awaiting each bus emission before picking
//! up the next entry. That consumer is the sole synchronization point for
//! log ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::events::{Envelope, IndexedEventBus, LogLevel, LogPayload};

enum QueueEntry {
    Record(Envelope),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Unbounded FIFO with a dedicated bus-emitting consumer
pub struct LogQueue {
    tx: mpsc::UnboundedSender<QueueEntry>,
    closed: AtomicBool,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl LogQueue {
    /// Create the queue and spawn its consumer
    pub fn new(bus: Arc<IndexedEventBus>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                match entry {
                    QueueEntry::Record(envelope) => bus.emit(envelope).await,
                    QueueEntry::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    QueueEntry::Shutdown => break,
                }
            }
        });

        Self {
            tx,
            closed: AtomicBool::new(false),
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Append a log entry; non-blocking, callable from any thread
    ///
    /// The timestamp is captured here, so entries carry the order their
    /// callers made the calls even when delivery happens later.
    pub fn enqueue(&self, level: LogLevel, payload: LogPayload) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let envelope = Envelope::log(Utc::now(), level, payload);
        if self.tx.send(QueueEntry::Record(envelope)).is_err() {
            tracing::warn!("Log queue consumer gone, entry dropped");
        }
    }

    /// Wait until every entry enqueued before this call has been emitted
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(QueueEntry::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop accepting entries, drain the backlog, and join the consumer
    ///
    /// The shutdown marker sits at the tail of the FIFO, so everything
    /// enqueued before the call is still delivered. If the consumer does not
    /// finish within `timeout` it is cancelled.
    pub async fn stop(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(QueueEntry::Shutdown);

        let handle = self.consumer.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                tracing::warn!("Log queue consumer did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Handler, Topic};

    fn payload(message: &str) -> LogPayload {
        LogPayload {
            message: message.to_string(),
            plugin: None,
        }
    }

    fn collect_messages(bus: &IndexedEventBus) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            Topic::Log,
            Handler::from_fn(move |envelope| {
                if let Envelope::Log { payload, .. } = envelope {
                    sink.lock().push(payload.message.clone());
                }
                Ok(())
            }),
        );
        seen
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let bus = Arc::new(IndexedEventBus::new());
        let seen = collect_messages(&bus);
        let queue = LogQueue::new(Arc::clone(&bus));

        for i in 0..20 {
            queue.enqueue(LogLevel::Info, payload(&format!("m{i}")));
        }
        queue.flush().await;

        let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enqueue_from_blocking_thread() {
        let bus = Arc::new(IndexedEventBus::new());
        let seen = collect_messages(&bus);
        let queue = Arc::new(LogQueue::new(Arc::clone(&bus)));

        queue.enqueue(LogLevel::Info, payload("S"));
        let worker = Arc::clone(&queue);
        tokio::task::spawn_blocking(move || {
            worker.enqueue(LogLevel::Info, payload("P1"));
            worker.enqueue(LogLevel::Info, payload("P2"));
        })
        .await
        .unwrap();
        queue.flush().await;

        assert_eq!(*seen.lock(), vec!["S", "P1", "P2"]);
    }

    #[tokio::test]
    async fn test_flush_waits_for_backlog() {
        let bus = Arc::new(IndexedEventBus::new());
        let seen = collect_messages(&bus);
        let queue = LogQueue::new(Arc::clone(&bus));

        for i in 0..100 {
            queue.enqueue(LogLevel::Debug, payload(&format!("{i}")));
        }
        queue.flush().await;
        assert_eq!(seen.lock().len(), 100);
    }

    #[tokio::test]
    async fn test_stop_drains_then_rejects() {
        let bus = Arc::new(IndexedEventBus::new());
        let seen = collect_messages(&bus);
        let queue = LogQueue::new(Arc::clone(&bus));

        queue.enqueue(LogLevel::Info, payload("before"));
        queue.stop(Duration::from_secs(1)).await;
        queue.enqueue(LogLevel::Info, payload("after"));
        // second stop is a no-op
        queue.stop(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock(), vec!["before"]);
    }
}
