//! tokenbus server
//!
//! One axum router serves both collaborators:
//! - the token authority over HTTP (`/login`, `/token`, `/verify`, `/logout`)
//! - the durable broker over WebSocket (`/ws`)

mod http;
pub mod protocol;
mod websocket;

pub use http::ApiError;
pub use protocol::{ClientMessage, ServerMessage};

use crate::auth::TokenAuthority;
use crate::broker::Broker;
use crate::pipeline::Shutdown;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub authority: Arc<TokenAuthority>,
    pub broker: Broker,
}

impl AppState {
    pub fn new(authority: Arc<TokenAuthority>, broker: Broker) -> Self {
        Self { authority, broker }
    }
}

/// Create the router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/login", post(http::login))
        .route("/token", post(http::token))
        .route("/verify", post(http::verify))
        .route("/logout", post(http::logout))
        .route("/health", get(http::health))
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(listener: TcpListener, state: AppState, mut shutdown: Shutdown) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = create_router(state);

    info!(addr = %addr, "tokenbus listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    Ok(())
}

/// Periodically drop expired refresh tokens from the active set
pub async fn purge_expired_loop(authority: Arc<TokenAuthority>, every: Duration, mut shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let purged = authority.purge_expired();
                if purged > 0 {
                    info!(purged, remaining = authority.active_count(), "Purged expired refresh tokens");
                } else {
                    debug!("No expired refresh tokens to purge");
                }
            }
        }
    }
}
