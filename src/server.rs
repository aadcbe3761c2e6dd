//! HTTP server exposing the observed health state.
//!
//! This module provides a local, read-only HTTP view for presentation
//! layers that cannot link the library directly:
//! - `GET /health` liveness and version
//! - `GET /state` the current step total and recent samples
//! - `GET /stats` transparency counters
//!
//! # Architecture
//!
//! ```text
//! SyncAgent ──watch──▶ server ──▶ GET /state ──▶ UI
//!                        │
//!                 TransparencyLog ──▶ GET /stats
//! ```

use crate::state::HealthState;
use crate::transparency::{SharedTransparencyLog, TransparencyStats};
use axum::{extract::State, http::HeaderValue, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Shared server state
pub struct ServerState {
    state: watch::Receiver<HealthState>,
    log: SharedTransparencyLog,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /state
async fn current_state(State(state): State<Arc<ServerState>>) -> Json<HealthState> {
    Json(state.state.borrow().clone())
}

/// GET /stats
async fn stats(State(state): State<Arc<ServerState>>) -> Json<TransparencyStats> {
    Json(state.log.stats())
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    state: watch::Receiver<HealthState>,
    log: SharedTransparencyLog,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let shared = Arc::new(ServerState { state, log });

    let app = Router::new()
        .route("/health", get(health))
        .route("/state", get(current_state))
        .route("/stats", get(stats))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(shared);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("State server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
