//! Beach Ring: the call signaling relay. Participants register by id over a
//! websocket and the relay forwards call envelopes between them without
//! looking inside.

pub mod config;
pub mod handlers;
pub mod relay;
pub mod websocket;

use std::net::SocketAddr;

use anyhow::Context;
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::handlers::health_check;
use crate::relay::Relay;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
}

pub fn build_router(relay: Relay) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(AppState { relay })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on `listener` until the server stops.
pub async fn serve(listener: TcpListener, config: RelayConfig) -> anyhow::Result<()> {
    let relay = Relay::new();
    let reaper = relay.spawn_reaper(config.heartbeat_interval, config.heartbeat_timeout);
    let app = build_router(relay);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;
    reaper.abort();
    result.context("relay server failed")
}
