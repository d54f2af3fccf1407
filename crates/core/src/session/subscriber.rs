//! Subscription adapter
//!
//! Binds one push-channel client to a session as a consumable stream:
//! replay of the ring buffer first, then the live feed, ending with the
//! close envelope. The transport layer drives the stream and writes each
//! envelope to its socket.
//!
//! Live envelopes are forwarded through a small bounded channel with an
//! awaited send. A slow consumer fills the channel, which blocks the bus's
//! serial delivery and, through it, the log queue consumer — backpressure
//! instead of unbounded buffering.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::events::{Envelope, Handler, IndexedEventBus, SubscriptionHandle, Topic};

use super::Session;

/// Capacity of the per-subscriber forwarding channel
const FORWARD_CAPACITY: usize = 64;

/// Ordered envelope stream for one subscriber
///
/// Dropping the stream unsubscribes its bus handlers; an abandoned client
/// never blocks the session.
pub struct SubscriptionStream {
    replay: std::collections::VecDeque<Envelope>,
    live: Option<mpsc::Receiver<Envelope>>,
    handles: Vec<SubscriptionHandle>,
    bus: Option<Arc<IndexedEventBus>>,
    last_replayed_seq: Option<u64>,
    done: bool,
}

/// Attach a subscriber to a session
///
/// If the session already emitted its close envelope, the stream yields a
/// single close (with the recorded reason) and ends: late attachers learn
/// the outcome without a replay.
pub fn subscribe(session: &Session) -> SubscriptionStream {
    if let Some(reason) = session.close_reason() {
        let mut replay = std::collections::VecDeque::new();
        replay.push_back(Envelope::close(reason));
        return SubscriptionStream {
            replay,
            live: None,
            handles: Vec::new(),
            bus: None,
            last_replayed_seq: None,
            done: false,
        };
    }

    let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
    let bus = Arc::clone(session.bus());

    // Register the forwarders before snapshotting the buffer, then drop
    // duplicates by sequence number: anything the snapshot already contains
    // arrives on the channel with a seq at or below the replay watermark.
    let mut handles = Vec::new();
    for topic in Topic::all() {
        let tx = tx.clone();
        handles.push(bus.subscribe(
            topic,
            Handler::from_async(move |envelope: Arc<Envelope>| {
                let tx = tx.clone();
                async move {
                    // a gone client is handled by the stream's Drop; nothing to report
                    let _ = tx.send((*envelope).clone()).await;
                    Ok(())
                }
            }),
        ));
    }

    let replay: std::collections::VecDeque<Envelope> =
        session.buffer_snapshot().into_iter().collect();
    let last_replayed_seq = replay.iter().filter_map(Envelope::seq).max();

    SubscriptionStream {
        replay,
        live: Some(rx),
        handles,
        bus: Some(bus),
        last_replayed_seq,
        done: false,
    }
}

impl SubscriptionStream {
    /// Next envelope, or `None` once the stream has ended
    ///
    /// The stream ends after yielding a close envelope or when the session
    /// is torn down.
    pub async fn next(&mut self) -> Option<Envelope> {
        if self.done {
            return None;
        }

        let envelope = match self.replay.pop_front() {
            Some(envelope) => Some(envelope),
            None => loop {
                let live = self.live.as_mut()?;
                match live.recv().await {
                    Some(envelope) => {
                        // skip what the replay already delivered
                        if let (Some(seq), Some(watermark)) =
                            (envelope.seq(), self.last_replayed_seq)
                        {
                            if seq <= watermark {
                                continue;
                            }
                        }
                        break Some(envelope);
                    }
                    None => break None,
                }
            },
        };

        match envelope {
            Some(envelope) => {
                if matches!(envelope, Envelope::Close { .. }) {
                    self.done = true;
                    self.detach();
                }
                Some(envelope)
            }
            None => {
                self.done = true;
                self.detach();
                None
            }
        }
    }

    fn detach(&mut self) {
        if let Some(bus) = self.bus.take() {
            for handle in self.handles.drain(..) {
                bus.unsubscribe(&handle);
            }
        }
        self.live = None;
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.detach();
    }
}
