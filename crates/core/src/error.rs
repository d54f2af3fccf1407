//! Error types for the gradekit session engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the session engine
///
/// Fatality is decided by the caller, not the variant: a `PluginRuntime`
/// error from an operational method is a per-submission failure, while the
/// same variant from stage setup would be run-fatal. See the runner for the
/// policy.
#[derive(Debug, Error)]
pub enum Error {
    /// Session or workflow configuration error (missing workflow, missing
    /// required stage, empty submission set)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Plugin id is not present in the registry
    #[error("Plugin '{0}' not found")]
    PluginNotFound(String),

    /// Plugin constructor failed
    #[error("Plugin '{plugin_id}' initialization failed: {message}")]
    PluginInit {
        /// Registry id of the plugin
        plugin_id: String,
        /// Constructor failure detail
        message: String,
    },

    /// Settings value failed schema validation or binding
    #[error("Settings error: {0}")]
    Settings(String),

    /// A plugin operational method failed
    #[error("Plugin execution failed: {0}")]
    PluginRuntime(String),

    /// Persistence gateway operation failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The session was asked to stop
    #[error("Session cancelled")]
    Cancelled,

    /// A plugin call exceeded the configured per-call timeout
    #[error("Plugin call timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Session lifecycle error (unknown session, already terminal)
    #[error("Session error: {0}")]
    Session(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
