// src/rpc.rs
//
// Admin HTTP surface: a liveness probe and an aggregated status snapshot.

use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};

use crate::engine::{Engine, EngineStatus};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

/// Serve the admin router until the process exits.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind admin listener on {bind}"))?;
    axum::serve(listener, router(state))
        .await
        .context("admin server terminated")
}
