//! gradekit-server: bundled HTTP/WebSocket server binary
//!
//! Wires the engine together from the environment:
//! - `BIND_ADDRESS` (default `127.0.0.1:8080`)
//! - `GRADEKIT_DB` — SQLite database path; in-memory persistence when unset
//! - engine knobs (`PARALLELISM`, `PLUGIN_CALL_TIMEOUT`, `LOG_BUFFER_SIZE`,
//!   `SESSION_EVICT_GRACE`, `LOG_PERSISTENCE`) via `EngineConfig::from_env`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use gradekit_core::config::EngineConfig;
use gradekit_core::persist::{MemoryGateway, PersistenceGateway, SqliteGateway};
use gradekit_core::plugin::{builtin, PluginRegistry};
use gradekit_core::session::SessionManager;
use gradekit_http::HttpServer;

/// How long shutdown waits for in-flight sessions
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::from_env();

    let registry = Arc::new(PluginRegistry::new());
    builtin::register_builtins(&registry).context("failed to register built-in plugins")?;

    let gateway: Arc<dyn PersistenceGateway> = match std::env::var("GRADEKIT_DB") {
        Ok(path) => {
            tracing::info!(path = %path, "Using SQLite persistence");
            Arc::new(SqliteGateway::new(Path::new(&path)).context("failed to open database")?)
        }
        Err(_) => {
            tracing::info!("GRADEKIT_DB not set, using in-memory persistence");
            Arc::new(MemoryGateway::new())
        }
    };

    let manager = Arc::new(SessionManager::new(config, registry, gateway));

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let server = HttpServer::new(bind_address, Arc::clone(&manager));

    tokio::select! {
        result = server.serve() => result.context("server exited")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down, cancelling active sessions");
            manager.shutdown(SHUTDOWN_DEADLINE).await;
        }
    }

    Ok(())
}
