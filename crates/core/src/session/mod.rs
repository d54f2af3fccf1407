//! Session lifecycle: live handles, store, runner, manager, subscriptions

mod manager;
mod persistence;
mod runner;
mod store;
mod subscriber;

pub use manager::SessionManager;
pub use persistence::SessionPersistence;
pub use runner::SessionRunner;
pub use store::SessionStore;
pub use subscriber::{subscribe, SubscriptionStream};

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::{Envelope, Handler, IndexedEventBus, Topic};
use crate::logging::{LogQueue, SessionLogger};

/// Live in-memory handle for one running (or recently terminated) session
///
/// Bundles the indexed bus, the session logger, the replay ring buffer, the
/// runner task handle, and the cancel signal. The ring buffer has a single
/// writer: the session's own bus subscription installed at construction.
pub struct Session {
    id: Uuid,
    bus: Arc<IndexedEventBus>,
    logger: SessionLogger,
    buffer: Mutex<VecDeque<Envelope>>,
    buffer_cap: usize,
    close_reason: Mutex<Option<String>>,
    cancel_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Build a session handle and install its history recorder
    pub(crate) fn new(id: Uuid, config: &EngineConfig) -> Arc<Self> {
        let bus = Arc::new(IndexedEventBus::new());
        let queue = Arc::new(LogQueue::new(Arc::clone(&bus)));
        let logger = SessionLogger::new(id, queue);
        let (cancel_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            bus,
            logger,
            buffer: Mutex::new(VecDeque::new()),
            buffer_cap: config.log_buffer_size,
            close_reason: Mutex::new(None),
            cancel_tx,
            task: Mutex::new(None),
        });

        for topic in Topic::all() {
            let recorder = Arc::downgrade(&session);
            session.bus.subscribe(
                topic,
                Handler::from_fn(move |envelope| {
                    if let Some(session) = recorder.upgrade() {
                        session.record(envelope);
                    }
                    Ok(())
                }),
            );
        }

        session
    }

    fn record(&self, envelope: &Envelope) {
        if let Some(reason) = envelope.close_reason() {
            *self.close_reason.lock() = Some(reason.to_string());
        }
        let mut buffer = self.buffer.lock();
        buffer.push_back(envelope.clone());
        while buffer.len() > self.buffer_cap {
            buffer.pop_front();
        }
    }

    /// Session id; identical to the workflow run id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The session's event bus
    pub fn bus(&self) -> &Arc<IndexedEventBus> {
        &self.bus
    }

    /// The session's logger
    pub fn logger(&self) -> &SessionLogger {
        &self.logger
    }

    /// Whether the terminal close envelope has been emitted
    pub fn is_closed(&self) -> bool {
        self.close_reason.lock().is_some()
    }

    /// Reason carried by the close envelope, once emitted
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Snapshot of the buffered envelopes, oldest first
    pub fn buffer_snapshot(&self) -> Vec<Envelope> {
        self.buffer.lock().iter().cloned().collect()
    }

    /// Ask the session to stop; in-flight sync plugin calls finish on their own
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Receiver observing the cancel signal
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LogLevel, LogPayload};
    use chrono::Utc;

    fn test_config(buffer: usize) -> EngineConfig {
        EngineConfig {
            log_buffer_size: buffer,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_history_recorded_across_topics() {
        let session = Session::new(Uuid::new_v4(), &test_config(10));
        session.logger().info("one");
        session.logger().flush().await;
        session
            .bus()
            .emit(Envelope::update(
                crate::events::UpdateObject::WorkflowRun,
                serde_json::json!({"id": "r"}),
            ))
            .await;

        let buffer = session.buffer_snapshot();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[0].topic(), Topic::Log);
        assert_eq!(buffer[1].topic(), Topic::Update);
    }

    #[tokio::test]
    async fn test_buffer_drops_oldest_beyond_cap() {
        let session = Session::new(Uuid::new_v4(), &test_config(3));
        for i in 0..5 {
            session
                .bus()
                .emit(Envelope::log(
                    Utc::now(),
                    LogLevel::Info,
                    LogPayload {
                        message: format!("m{i}"),
                        plugin: None,
                    },
                ))
                .await;
        }

        let buffer = session.buffer_snapshot();
        assert_eq!(buffer.len(), 3);
        // oldest entries were dropped from replay
        let first = match &buffer[0] {
            Envelope::Log { payload, .. } => payload.message.clone(),
            _ => unreachable!(),
        };
        assert_eq!(first, "m2");
    }

    #[tokio::test]
    async fn test_close_latch() {
        let session = Session::new(Uuid::new_v4(), &test_config(10));
        assert!(!session.is_closed());
        session.bus().emit(Envelope::close("session completed")).await;
        assert!(session.is_closed());
        assert_eq!(session.close_reason().as_deref(), Some("session completed"));
    }
}
