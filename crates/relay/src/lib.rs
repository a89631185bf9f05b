// crates/relay/src/lib.rs
//! Realtime job update fanout.
//!
//! Clients connect over WebSocket, subscribe to a team, receive a snapshot
//! of the team's jobs and then a stream of normalized updates. Updates reach
//! every relay instance through the coordination store's `job_updates`
//! pub/sub channel.

pub mod config;
pub mod fanout;
pub mod listener;
pub mod metrics;
pub mod protocol;
pub mod state;
pub mod ws;

use std::sync::Arc;

use anyhow::{bail, Context};
use axum::{routing::get, Router};
use jobpulse_store::{MemoryStore, RedisStore, SharedStore};
use state::RelayState;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn app(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(ws::ws_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Open the store named by `url`: `memory://` or `redis://…` / `rediss://…`.
pub async fn connect_store(url: &str) -> anyhow::Result<SharedStore> {
    if url.starts_with("memory://") {
        tracing::warn!("using in-memory store; updates will not reach other instances");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = RedisStore::connect(url)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        return Ok(Arc::new(store));
    }
    bail!("unsupported store URL {url:?}; expected memory:// or redis://")
}
