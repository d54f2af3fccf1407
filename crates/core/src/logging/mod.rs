//! Session log pipeline
//!
//! Log calls from the runner and from plugin code — async tasks and
//! `spawn_blocking` workers alike — funnel through a single [`LogQueue`]
//! consumer, which is what gives the session its deterministic log ordering.

mod logger;
mod queue;

pub use logger::{PluginLogger, SessionLogger};
pub use queue::LogQueue;
