//! HTTP API handlers

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{IdentityMode, RelayFraming};
use crate::protocol::dispatch::DispatchStats;
use crate::protocol::StreamKind;
use crate::relay::{PeerSummary, RelayStatsSnapshot};
use crate::status::server::StatusState;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Relay status
#[derive(Debug, Serialize)]
pub struct RelayStatus {
    /// Registry entries; a handshake client counts once per identity it uses
    pub peer_count: usize,
    /// Distinct users behind those entries
    pub user_count: usize,
    pub uptime_seconds: u64,
    pub identity: IdentityMode,
    pub framing: RelayFraming,
    pub streams: Vec<StreamKind>,
    pub stats: RelayStatsSnapshot,
    pub datagrams: DispatchStats,
}

/// Get relay status
pub async fn get_status(State(state): State<Arc<StatusState>>) -> Json<ApiResponse<RelayStatus>> {
    let status = RelayStatus {
        peer_count: state.registry.len(),
        user_count: state.registry.user_count(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        identity: state.identity,
        framing: state.framing,
        streams: state.streams.clone(),
        stats: state.stats.snapshot(),
        datagrams: state.dispatcher.stats(),
    };

    Json(ApiResponse::ok(status))
}

/// Get all registered peers
pub async fn get_peers(State(state): State<Arc<StatusState>>) -> Json<ApiResponse<Vec<PeerSummary>>> {
    Json(ApiResponse::ok(state.registry.snapshot(Instant::now())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::protocol::dispatch::ControlDispatcher;
    use crate::relay::queue::StreamQueue;
    use crate::relay::{PeerKey, PeerRegistry, RelayStats};
    use std::time::Duration;

    fn state() -> Arc<StatusState> {
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(5)));
        Arc::new(StatusState::new(
            registry,
            Arc::new(RelayStats::default()),
            Arc::new(ControlDispatcher::new()),
            &RelayConfig::default(),
        ))
    }

    #[test]
    fn test_api_response_serialization() {
        let ok = serde_json::to_value(ApiResponse::ok(3)).unwrap();
        assert_eq!(ok, serde_json::json!({ "success": true, "data": 3 }));

        let err = serde_json::to_value(ApiResponse::<()>::error("nope")).unwrap();
        assert_eq!(err, serde_json::json!({ "success": false, "error": "nope" }));
    }

    #[tokio::test]
    async fn test_get_status() {
        let Json(response) = get_status(State(state())).await;
        let status = response.data.unwrap();

        assert!(response.success);
        assert_eq!(status.peer_count, 0);
        assert_eq!(status.streams, vec![StreamKind::Datagram, StreamKind::Chat]);
    }

    #[tokio::test]
    async fn test_status_counts_entries_and_users() {
        let state = state();
        let now = Instant::now();
        let (chat, _chat_rx) = StreamQueue::channel(StreamKind::Chat, 1, 4);
        let (ana_dgram, _ana_rx) = StreamQueue::channel(StreamKind::Datagram, 2, 4);
        let (ben_dgram, _ben_rx) = StreamQueue::channel(StreamKind::Datagram, 3, 4);
        state
            .registry
            .attach(PeerKey::Client(uuid::Uuid::new_v4()), chat, Some("ana"), now);
        state.registry.attach(
            PeerKey::Datagram("127.0.0.1:5000".parse().unwrap()),
            ana_dgram,
            Some("ana"),
            now,
        );
        state.registry.attach(
            PeerKey::Datagram("127.0.0.1:5001".parse().unwrap()),
            ben_dgram,
            Some("ben"),
            now,
        );

        let Json(response) = get_status(State(state)).await;
        let status = response.data.unwrap();
        assert_eq!(status.peer_count, 3);
        assert_eq!(status.user_count, 2);
    }

    #[tokio::test]
    async fn test_get_peers() {
        let state = state();
        let (queue, _rx) = StreamQueue::channel(StreamKind::Datagram, 1, 4);
        let key = PeerKey::Datagram("127.0.0.1:5000".parse().unwrap());
        state.registry.attach(key, queue, Some("ana"), Instant::now());

        let Json(response) = get_peers(State(state)).await;
        let peers = response.data.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].key, "127.0.0.1:5000");
        assert_eq!(peers[0].user.as_deref(), Some("ana"));

        let json = serde_json::to_value(&peers[0]).unwrap();
        assert_eq!(json["kinds"], serde_json::json!(["datagram"]));
        assert_eq!(json["state"], "active");
    }
}
