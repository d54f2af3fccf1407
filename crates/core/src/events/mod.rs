//! Session event plumbing
//!
//! The engine communicates with subscribers exclusively through [`Envelope`]
//! values published on a per-session [`EventBus`]. The [`IndexedEventBus`]
//! variant additionally stamps a strictly monotonic sequence number so
//! subscribers can detect loss or reordering on their own.

mod bus;
mod envelope;

pub use bus::{EventBus, Handler, IndexedEventBus, SubscriptionHandle};
pub use envelope::{Envelope, LogLevel, LogPayload, UpdateObject};

/// Topics a session bus carries
///
/// The set is closed: every envelope kind maps to exactly one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Structured log lines from the session and its plugins
    Log,
    /// Post-commit entity updates (workflow run, submissions)
    Update,
    /// Terminal envelope; always the last one on a channel
    Close,
}

impl Topic {
    /// All topics, in the order the session's history recorder subscribes
    pub fn all() -> [Topic; 3] {
        [Topic::Log, Topic::Update, Topic::Close]
    }
}
