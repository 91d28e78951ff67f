//! Thin HTTP control surface.
//!
//! Serves a read-only snapshot of the identity cache, a bulk cache clear,
//! and a connection status line. The transport collaborator drives the
//! bridge's lifecycle callbacks through the `/transport/*` routes.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::bridge::{Bridge, InboundMessage, LinkState};
use crate::identity::{CacheSnapshot, IdentityCache};

#[derive(Clone)]
pub struct ControlState {
    pub bridge: Arc<Bridge>,
    pub identities: Arc<IdentityCache>,
    /// Team and bot names from the startup auth check, for the status line.
    pub team: String,
    pub bot_name: String,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/cache", get(cache_snapshot))
        .route("/cache/expire", post(cache_expire))
        .route("/transport/hello", post(transport_hello))
        .route("/transport/event", post(transport_event))
        .route("/transport/close", post(transport_close))
        .route("/transport/closed", post(transport_closed))
        .with_state(state)
}

pub async fn serve(bind: String, state: ControlState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind control surface to {bind}"))?;
    info!("Control surface listening on {bind}");
    axum::serve(listener, router(state))
        .await
        .context("control surface server failed")
}

async fn status(State(state): State<ControlState>) -> String {
    match state.bridge.state().await {
        LinkState::Live => format!("Connected to {} as {}", state.team, state.bot_name),
        _ => "Not Connected".to_string(),
    }
}

async fn cache_snapshot(State(state): State<ControlState>) -> Json<CacheSnapshot> {
    Json(state.identities.snapshot().await)
}

async fn cache_expire(State(state): State<ControlState>) -> &'static str {
    state.identities.clear_all().await;
    "ok"
}

async fn transport_hello(State(state): State<ControlState>) -> StatusCode {
    state.bridge.on_hello().await;
    StatusCode::OK
}

async fn transport_event(
    State(state): State<ControlState>,
    Json(message): Json<InboundMessage>,
) -> StatusCode {
    state.bridge.on_message(message).await;
    StatusCode::ACCEPTED
}

async fn transport_close(State(state): State<ControlState>) -> StatusCode {
    state.bridge.on_close().await;
    StatusCode::OK
}

async fn transport_closed(State(state): State<ControlState>) -> StatusCode {
    state.bridge.on_closed().await;
    StatusCode::OK
}
