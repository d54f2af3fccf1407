//! HTTP/WebSocket transport for the gradekit session engine
//!
//! Exposes the engine's session control surface:
//! - `POST /sessions` — create a session from `{workflow_id, submission_ids}`
//! - `GET /sessions/{id}` — WebSocket upgrade; the server streams envelopes
//!   (buffer replay first, then live) until the `close` envelope
//! - `GET /health` — liveness probe
//!
//! Authentication lives outside the engine: handlers read the authenticated
//! [`Principal`] from request extensions. The bundled `principal_from_header`
//! middleware fills it from an `X-User-Id` header for development setups;
//! deployments replace it with their real auth layer.

mod error;
mod server;

pub use error::{Error, Result};
pub use server::{HttpServer, Principal};
