//! # Locus Relay
//!
//! Star-topology relay for real-time audio, video and chat among meeting peers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── PEER ────────────────────────────┐
//! │  camera ─► JPEG ─► FrameFragmenter ──┐                       │
//! │  mic ─► PCM ─► ControlMessage::Audio ┼─► datagram socket ────┼──┐
//! │  chat ─► ControlMessage::Chat ───────┴─► chat stream ────────┼─┐│
//! └──────────────────────────────────────────────────────────────┘ ││
//!                                                                  ││
//! ┌──────────────────────────── RELAY ───────────────────────────┐ ││
//! │  datagram loop ◄─────────────────────────────────────────────┼─┼┘
//! │  stream accept loops (chat, audio, video) ◄──────────────────┼─┘
//! │        │                                                     │
//! │        ▼                                                     │
//! │  ControlDispatcher ─► PeerRegistry (touch / register)        │
//! │        │                                                     │
//! │        ▼                                                     │
//! │  BroadcastRelay: targets = peers on this stream − sender     │
//! │        │                                                     │
//! │        ▼  try_send, drop newest when full                    │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐                │
//! │  │ queue B/vid│ │ queue C/vid│ │ queue C/cht│  ...           │
//! │  │ sender task│ │ sender task│ │ sender task│                │
//! │  └─────┬──────┘ └─────┬──────┘ └─────┬──────┘                │
//! └────────┼──────────────┼──────────────┼───────────────────────┘
//!          ▼              ▼              ▼
//!   FrameReassembler ─► decoder     JitterBuffer ─► audio output
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod protocol;
pub mod relay;
pub mod status;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default port for the shared datagram channel
    pub const DEFAULT_DATAGRAM_PORT: u16 = 9999;

    /// Default port for the reliable chat stream
    pub const DEFAULT_CHAT_PORT: u16 = 9997;

    /// Default reliable audio stream port (multi-port variant)
    pub const DEFAULT_AUDIO_PORT: u16 = 9999;

    /// Default reliable video stream port (multi-port variant)
    pub const DEFAULT_VIDEO_PORT: u16 = 9998;

    /// Default port for the status API
    pub const DEFAULT_STATUS_PORT: u16 = 8080;

    /// Largest fragment chunk, kept under the datagram size ceiling
    pub const DEFAULT_MAX_FRAGMENT_PAYLOAD: usize = 60_000;

    /// Default capture rate
    pub const DEFAULT_TARGET_FPS: u32 = 30;

    /// Audio blocks held by the receive-side jitter buffer
    pub const DEFAULT_JITTER_DEPTH: usize = 5;

    /// Per-peer outbound queue depth for media streams
    pub const DEFAULT_QUEUE_DEPTH: usize = 10;

    /// Per-peer outbound queue depth for chat
    pub const DEFAULT_CHAT_QUEUE_DEPTH: usize = 128;

    /// Silence after which a datagram-only peer is considered gone
    pub const DEFAULT_LIVENESS_TTL_MS: u64 = 5_000;

    /// Datagram socket receive buffer
    pub const DEFAULT_RECV_BUFFER_BYTES: usize = 10 * 1024 * 1024;

    /// Largest reliable stream frame accepted
    pub const DEFAULT_MAX_STREAM_FRAME: usize = 16 * 1024 * 1024;

    /// Receive buffer for one datagram
    pub const MAX_DATAGRAM_SIZE: usize = 65_536;
}
