//! Jamroom - Relay Server
//!
//! Sequences room events and fans them out to every member over
//! WebSocket. Rooms are in-memory only; an empty room disappears.
//!
//! Usage:
//!   cargo run --release
//!   RELAY_ADDR=0.0.0.0:3000 cargo run --release

mod handlers;
mod metrics;
mod state;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Default bind address when `RELAY_ADDR` is not set
const DEFAULT_ADDR: &str = "127.0.0.1:3000";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::var("RELAY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let state = Arc::new(state::AppState::new());

    let app = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/healthz", get(handlers::healthz))
        .route("/stats", get(handlers::stats))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("relay listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
