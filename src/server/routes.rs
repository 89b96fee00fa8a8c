//! HTTP and WebSocket routes.

use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::channel::Channel;
use crate::hub::{Hub, HubStats};
use crate::server::gate::{ConnectGate, ConnectRequest};
use crate::server::websocket::serve_socket;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub gate: Arc<dyn ConnectGate>,
}

/// Basic health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Per-room client counts
pub async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}

async fn doc_socket(
    ws: WebSocketUpgrade,
    Path(doc_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, ConnectRequest { doc_id, headers, channel: Channel::Document, public: false }).await
}

async fn note_socket(
    ws: WebSocketUpgrade,
    Path(doc_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, ConnectRequest { doc_id, headers, channel: Channel::Note, public: false }).await
}

async fn public_doc_socket(
    ws: WebSocketUpgrade,
    Path(doc_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, ConnectRequest { doc_id, headers, channel: Channel::Document, public: true }).await
}

/// Run the gate, then either upgrade or answer with the gate's error.
async fn upgrade(ws: WebSocketUpgrade, state: AppState, request: ConnectRequest) -> Response {
    match state.gate.admit(&request).await {
        Ok(identity) => {
            let hub = state.hub.clone();
            let (channel, doc_id) = (request.channel, request.doc_id);
            ws.on_upgrade(move |socket| serve_socket(socket, hub, channel, doc_id, identity))
        }
        Err(e) => {
            warn!(doc_id = %request.doc_id, error = %e, code = e.error_code(), "Upgrade refused");
            e.into_response()
        }
    }
}

/// Creates and configures the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/stats", get(stats))
        .route("/ws/docs/:doc_id", get(doc_socket))
        .route("/ws/notes/:doc_id", get(note_socket))
        .route("/ws/public/docs/:doc_id", get(public_doc_socket))
        .with_state(state)
}
