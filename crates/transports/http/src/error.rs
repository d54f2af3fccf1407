//! Error types for the HTTP transport

use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the HTTP transport
#[derive(Debug, Error)]
pub enum Error {
    /// Server setup or runtime error
    #[error("Server error: {0}")]
    Server(String),

    /// Error bubbled up from the engine
    #[error(transparent)]
    Engine(#[from] gradekit_core::Error),
}
