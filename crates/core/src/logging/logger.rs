//! Session and plugin loggers
//!
//! A logger is a thin facade over the session's [`LogQueue`]. Child loggers
//! handed to plugins tag every payload with the plugin id and share the
//! parent's queue — sharing the queue is what keeps session-level and
//! plugin-level lines in one global emission order.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::events::{LogLevel, LogPayload};

use super::LogQueue;

/// Structured logger for one session
#[derive(Clone)]
pub struct SessionLogger {
    session_id: Uuid,
    queue: Arc<LogQueue>,
}

impl SessionLogger {
    /// Create a logger over the session's queue
    pub fn new(session_id: Uuid, queue: Arc<LogQueue>) -> Self {
        Self { session_id, queue }
    }

    /// Session this logger belongs to
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Emit a line at the given level; non-blocking
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.queue.enqueue(
            level,
            LogPayload {
                message: message.into(),
                plugin: None,
            },
        );
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Wait until everything logged so far has reached the bus
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Drain and shut down the underlying queue
    pub async fn stop(&self, timeout: Duration) {
        self.queue.stop(timeout).await;
    }

    /// Logger for a specific plugin, sharing this session's queue
    pub fn get_child(&self, plugin_id: impl Into<String>) -> PluginLogger {
        PluginLogger {
            session_id: self.session_id,
            plugin_id: plugin_id.into(),
            queue: Arc::clone(&self.queue),
        }
    }
}

/// Logger handed to a plugin instance
///
/// Tags every line with the plugin id for attribution downstream.
#[derive(Clone)]
pub struct PluginLogger {
    session_id: Uuid,
    plugin_id: String,
    queue: Arc<LogQueue>,
}

impl PluginLogger {
    /// Session this logger belongs to
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Plugin id stamped on every line
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Emit a line at the given level; non-blocking, safe from worker threads
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.queue.enqueue(
            level,
            LogPayload {
                message: message.into(),
                plugin: Some(self.plugin_id.clone()),
            },
        );
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}
