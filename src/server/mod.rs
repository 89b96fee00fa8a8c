//! Web server module for the collaboration relay.
//!
//! Axum routes for health and stats, plus the WebSocket upgrade endpoints
//! that hand admitted connections to the hub.

pub mod gate;
pub mod routes;
pub mod websocket;

pub use gate::{ConnectGate, ConnectRequest, ProxyHeaderGate};
pub use routes::{AppState, create_router};
