//! Gradekit Core - transport-agnostic session execution engine
//!
//! This crate runs batches of student submissions through a three-stage
//! grading pipeline (transcription, grading, validation) whose stages are
//! user-supplied plugins.
//!
//! # Architecture
//!
//! Core is a pure library that:
//! - Defines the plugin SDK (`TranscriptionPlugin`, `GradePlugin`,
//!   `ValidationPlugin` traits plus the settings schema)
//! - Provides the execution engine (`SessionManager` → `SessionRunner`)
//! - Manages the per-session event bus, log queue, and replay buffer
//! - Talks to storage only through the `PersistenceGateway` trait
//!
//! Transport implementations (HTTP/WebSocket, others) are separate crates
//! that depend on gradekit-core, resolve sessions through the
//! `SessionStore`, and drive a `SubscriptionStream` over their socket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gradekit_core::config::EngineConfig;
//! use gradekit_core::persist::MemoryGateway;
//! use gradekit_core::plugin::{builtin, PluginRegistry};
//! use gradekit_core::session::SessionManager;
//!
//! # async fn demo(workflow_id: uuid::Uuid, submission_ids: Vec<uuid::Uuid>, user: uuid::Uuid) {
//! let registry = Arc::new(PluginRegistry::new());
//! builtin::register_builtins(&registry).unwrap();
//! let gateway = Arc::new(MemoryGateway::new());
//! let manager = SessionManager::new(EngineConfig::from_env(), registry, gateway);
//!
//! let view = manager
//!     .create_session(workflow_id, submission_ids, user, None)
//!     .await
//!     .unwrap();
//! let session = manager.get(view.id).unwrap();
//! let mut stream = gradekit_core::session::subscribe(&session);
//! while let Some(envelope) = stream.next().await {
//!     println!("{}", serde_json::to_string(&envelope).unwrap());
//! }
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod logging;
pub mod persist;
pub mod plugin;
pub mod session;

pub use error::{Error, Result};

// Convenience re-exports for the common surface
pub use config::EngineConfig;
pub use events::{Envelope, EventBus, IndexedEventBus, LogLevel, Topic};
pub use persist::PersistenceGateway;
pub use plugin::PluginRegistry;
pub use session::{SessionManager, SessionStore};
