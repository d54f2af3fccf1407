//! HTTP server with WebSocket session streaming
//!
//! Thin layer over the engine: handlers translate HTTP/WS to
//! `SessionManager` calls and drive a `SubscriptionStream` per socket.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use gradekit_core::domain::RunStatus;
use gradekit_core::events::Envelope;
use gradekit_core::session::{subscribe, SessionManager};

use crate::error::{Error, Result};

/// Authenticated caller, injected into request extensions by the auth layer
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
}

/// HTTP server state shared across handlers
#[derive(Clone)]
struct ServerState {
    manager: Arc<SessionManager>,
}

/// HTTP server exposing the session control API and push channel
pub struct HttpServer {
    bind_address: String,
    state: ServerState,
}

impl HttpServer {
    /// Create a server bound to the given address
    pub fn new(bind_address: String, manager: Arc<SessionManager>) -> Self {
        Self {
            bind_address,
            state: ServerState { manager },
        }
    }

    /// Build the router with all endpoints
    fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/sessions", post(create_session_handler))
            .route("/sessions/:session_id", get(ws_session_handler))
            .layer(middleware::from_fn(principal_from_header))
            .with_state(self.state.clone())
            .layer(
                tower::ServiceBuilder::new()
                    .layer(tower_http::trace::TraceLayer::new_for_http())
                    .layer(tower_http::cors::CorsLayer::permissive()),
            )
    }

    /// Start serving; blocks until the listener fails or the task is aborted
    pub async fn serve(self) -> Result<()> {
        let addr: std::net::SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| Error::Server(format!("invalid bind address: {e}")))?;

        tracing::info!("Starting HTTP server on {}", addr);

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("failed to bind: {e}")))?;

        axum::serve(listener, router)
            .await
            .map_err(|e| Error::Server(format!("server failed: {e}")))
    }
}

/// Development auth shim: `X-User-Id` header → [`Principal`] extension
///
/// Deployments put their real authentication middleware here instead; the
/// engine only ever sees the resulting principal.
async fn principal_from_header(mut request: Request<axum::body::Body>, next: Next) -> Response {
    let principal = request
        .headers()
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .map(|user_id| Principal { user_id });
    if let Some(principal) = principal {
        request.extensions_mut().insert(principal);
    }
    next.run(request).await
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct SessionCreateRequest {
    workflow_id: Uuid,
    submission_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct SessionCreateResponse {
    session_id: Uuid,
    status: RunStatus,
    stream_url: String,
}

fn error_body(message: &str) -> Json<serde_json::Value> {
    Json(json!({"error": message}))
}

async fn create_session_handler(
    State(state): State<ServerState>,
    principal: Option<Extension<Principal>>,
    Json(payload): Json<SessionCreateRequest>,
) -> Response {
    let Some(Extension(principal)) = principal else {
        return (StatusCode::UNAUTHORIZED, error_body("not authenticated")).into_response();
    };
    if payload.submission_ids.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("at least one submission id must be provided"),
        )
            .into_response();
    }

    match state
        .manager
        .create_session(
            payload.workflow_id,
            payload.submission_ids,
            principal.user_id,
            None,
        )
        .await
    {
        Ok(view) => (
            StatusCode::CREATED,
            Json(SessionCreateResponse {
                session_id: view.id,
                status: view.status,
                stream_url: format!("/sessions/{}", view.id),
            }),
        )
            .into_response(),
        Err(gradekit_core::Error::Config(message)) if message == "workflow not found" => {
            (StatusCode::NOT_FOUND, error_body(&message)).into_response()
        }
        Err(gradekit_core::Error::Config(message)) => {
            (StatusCode::BAD_REQUEST, error_body(&message)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Session creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("session creation failed"),
            )
                .into_response()
        }
    }
}

async fn ws_session_handler(
    State(state): State<ServerState>,
    Path(session_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, session_id, socket))
}

async fn handle_socket(state: ServerState, session_id: Uuid, mut socket: WebSocket) {
    let Some(session) = state.manager.get(session_id) else {
        let close = Envelope::close("session not found");
        if let Ok(text) = serde_json::to_string(&close) {
            let _ = socket.send(Message::Text(text)).await;
        }
        let _ = socket.close().await;
        return;
    };

    let mut stream = subscribe(&session);
    loop {
        tokio::select! {
            envelope = stream.next() => {
                match envelope {
                    Some(envelope) => {
                        let text = match serde_json::to_string(&envelope) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to encode envelope");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            // client gone; dropping the stream unsubscribes
                            return;
                        }
                    }
                    // close envelope delivered (or session torn down)
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // clients send no meaningful payloads in the current design
                    Some(Ok(_)) => {}
                    // disconnect: unsubscribe and close quietly
                    Some(Err(_)) | None => return,
                }
            }
        }
    }

    let _ = socket.close().await;
}
