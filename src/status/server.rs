//! Status API server

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::config::{IdentityMode, RelayConfig, RelayFraming};
use crate::error::Result;
use crate::protocol::dispatch::ControlDispatcher;
use crate::protocol::StreamKind;
use crate::relay::{PeerRegistry, RelayStats};
use crate::status::handlers;

/// Shared state behind the status routes
pub struct StatusState {
    pub registry: Arc<PeerRegistry>,
    pub stats: Arc<RelayStats>,
    pub dispatcher: Arc<ControlDispatcher>,
    pub identity: IdentityMode,
    pub framing: RelayFraming,
    pub streams: Vec<StreamKind>,
    pub started_at: Instant,
}

impl StatusState {
    pub fn new(
        registry: Arc<PeerRegistry>,
        stats: Arc<RelayStats>,
        dispatcher: Arc<ControlDispatcher>,
        config: &RelayConfig,
    ) -> Self {
        let mut streams = vec![StreamKind::Datagram];
        streams.extend(config.network.stream_ports().into_iter().map(|(kind, _)| kind));

        Self {
            registry,
            stats,
            dispatcher,
            identity: config.relay.identity,
            framing: config.relay.framing,
            streams,
            started_at: Instant::now(),
        }
    }
}

/// Build the route table
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/peers", get(handlers::get_peers))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Serve the status API until `shutdown` fires
pub async fn serve(listener: TcpListener, state: StatusState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Status API on http://{}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
