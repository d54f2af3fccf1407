//! Topic-keyed publish/subscribe bus
//!
//! Handlers are registered per topic and invoked in subscription order.
//! Subscriptions are identified by opaque tokens rather than by handler
//! identity, so closures can be unsubscribed without comparing function
//! pointers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::Result;

use super::{Envelope, Topic};

type HandlerFn = Box<dyn Fn(Arc<Envelope>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A subscriber callback, synchronous or asynchronous
///
/// Both styles register through the same type; the bus awaits every handler
/// before moving on to the next one.
pub struct Handler {
    f: HandlerFn,
}

impl Handler {
    /// Wrap a synchronous callback
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            f: Box::new(move |envelope| {
                let result = f(&envelope);
                Box::pin(async move { result })
            }),
        }
    }

    /// Wrap an asynchronous callback
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            f: Box::new(move |envelope| Box::pin(f(envelope))),
        }
    }
}

/// Token returned by [`EventBus::subscribe`], usable with `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: Topic,
    token: u64,
}

struct Registration {
    token: u64,
    handler: Arc<Handler>,
}

/// Topic-keyed publish/subscribe primitive
///
/// Delivery is serial: `emit` awaits each handler in subscription order
/// before returning. Handler errors are logged and swallowed; they never
/// prevent later handlers from observing the event. There are no persistent
/// subscriptions across process restarts.
pub struct EventBus {
    listeners: RwLock<HashMap<Topic, Vec<Registration>>>,
    next_token: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Register a handler for a topic
    pub fn subscribe(&self, topic: Topic, handler: Handler) -> SubscriptionHandle {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(topic)
            .or_default()
            .push(Registration {
                token,
                handler: Arc::new(handler),
            });
        SubscriptionHandle { topic, token }
    }

    /// Remove a subscription; idempotent
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Some(registrations) = self.listeners.write().get_mut(&handle.topic) {
            registrations.retain(|r| r.token != handle.token);
        }
    }

    /// Deliver an envelope to every current subscriber of its topic
    pub async fn emit(&self, envelope: Envelope) {
        let envelope = Arc::new(envelope);
        // Snapshot under the lock, await outside it
        let handlers: Vec<Arc<Handler>> = {
            let listeners = self.listeners.read();
            match listeners.get(&envelope.topic()) {
                Some(registrations) => registrations.iter().map(|r| Arc::clone(&r.handler)).collect(),
                None => return,
            }
        };

        for handler in handlers {
            if let Err(e) = (handler.f)(Arc::clone(&envelope)).await {
                tracing::warn!(error = %e, topic = ?envelope.topic(), "Event handler failed");
            }
        }
    }

    /// Number of subscribers currently registered for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.listeners
            .read()
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus wrapper that stamps a strictly monotonic per-bus sequence number
///
/// The counter lock is held across the inner emit, so delivery order always
/// equals sequence order. Subscribers can use the `seq` field to detect loss
/// or reordering independently.
pub struct IndexedEventBus {
    bus: EventBus,
    next_seq: tokio::sync::Mutex<u64>,
}

impl IndexedEventBus {
    /// Create an empty indexed bus
    pub fn new() -> Self {
        Self {
            bus: EventBus::new(),
            next_seq: tokio::sync::Mutex::new(0),
        }
    }

    /// Register a handler for a topic
    pub fn subscribe(&self, topic: Topic, handler: Handler) -> SubscriptionHandle {
        self.bus.subscribe(topic, handler)
    }

    /// Remove a subscription; idempotent
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.bus.unsubscribe(handle)
    }

    /// Stamp the next sequence number and deliver the envelope
    pub async fn emit(&self, mut envelope: Envelope) {
        let mut next_seq = self.next_seq.lock().await;
        envelope.set_seq(*next_seq);
        *next_seq += 1;
        self.bus.emit(envelope).await;
    }

    /// Number of subscribers currently registered for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.bus.subscriber_count(topic)
    }
}

impl Default for IndexedEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;

    fn close(reason: &str) -> Envelope {
        Envelope::close(reason)
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            Topic::Close,
            Handler::from_fn(move |envelope| {
                sink.lock().push(envelope.close_reason().unwrap().to_string());
                Ok(())
            }),
        );

        bus.emit(close("a")).await;
        bus.emit(close("b")).await;
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_handlers_invoked_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let sink = Arc::clone(&order);
            bus.subscribe(
                Topic::Close,
                Handler::from_fn(move |_| {
                    sink.lock().push(tag);
                    Ok(())
                }),
            );
        }

        bus.emit(close("x")).await;
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let handle = bus.subscribe(
            Topic::Log,
            Handler::from_fn(move |_| {
                *sink.lock() += 1;
                Ok(())
            }),
        );
        assert_eq!(bus.subscriber_count(Topic::Log), 1);

        bus.unsubscribe(&handle);
        bus.unsubscribe(&handle);
        assert_eq!(bus.subscriber_count(Topic::Log), 0);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_delivery() {
        let bus = EventBus::new();
        bus.subscribe(
            Topic::Close,
            Handler::from_fn(|_| Err(Error::Session("handler exploded".to_string()))),
        );
        let seen = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            Topic::Close,
            Handler::from_fn(move |_| {
                *sink.lock() = true;
                Ok(())
            }),
        );

        bus.emit(close("x")).await;
        assert!(*seen.lock());
    }

    #[tokio::test]
    async fn test_async_handler_awaited() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            Topic::Close,
            Handler::from_async(move |envelope: Arc<Envelope>| {
                let sink = Arc::clone(&sink);
                async move {
                    tokio::task::yield_now().await;
                    sink.lock().push(envelope.close_reason().unwrap().to_string());
                    Ok(())
                }
            }),
        );

        bus.emit(close("later")).await;
        // emit awaits the handler, so the effect is visible immediately after
        assert_eq!(*seen.lock(), vec!["later"]);
    }

    #[tokio::test]
    async fn test_indexed_bus_monotonic_seq() {
        let bus = IndexedEventBus::new();
        let seqs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seqs);
        bus.subscribe(
            Topic::Close,
            Handler::from_fn(move |envelope| {
                sink.lock().push(envelope.seq().unwrap());
                Ok(())
            }),
        );

        for _ in 0..5 {
            bus.emit(close("x")).await;
        }
        assert_eq!(*seqs.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_indexed_bus_seq_spans_topics() {
        let bus = IndexedEventBus::new();
        let seqs = Arc::new(Mutex::new(Vec::new()));
        for topic in [Topic::Log, Topic::Close] {
            let sink = Arc::clone(&seqs);
            bus.subscribe(
                topic,
                Handler::from_fn(move |envelope| {
                    sink.lock().push(envelope.seq().unwrap());
                    Ok(())
                }),
            );
        }

        bus.emit(Envelope::log(
            chrono::Utc::now(),
            crate::events::LogLevel::Info,
            crate::events::LogPayload {
                message: "m".to_string(),
                plugin: None,
            },
        ))
        .await;
        bus.emit(close("x")).await;
        assert_eq!(*seqs.lock(), vec![0, 1]);
    }
}
