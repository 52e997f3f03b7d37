//! Configuration for the relay and its peers
//!
//! Both configs are TOML with every section optional. Lookup order: an
//! explicit path, then `relay.toml` / `client.toml` in the platform config
//! directory, then built-in defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::fragment::{MAX_DATAGRAM_PAYLOAD, MAX_HEADER_LEN};
use crate::protocol::StreamKind;

/// How the relay identifies peers on reliable streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    /// Explicit handshake issuing a client id, shared by all of a peer's streams
    Handshake,
    /// No handshake; streams from one remote IP belong to one peer
    Address,
}

/// What the relay writes in front of forwarded stream records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayFraming {
    /// Sender identity prefix followed by the inner record
    Prefixed,
    /// Inner record only
    Verbatim,
}

/// Which channel a client uses for audio and video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaTransport {
    /// Video fragments and audio blocks on the shared datagram channel
    Datagram,
    /// One reliable stream per media kind
    Stream,
}

/// Listening sockets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub datagram_port: u16,
    pub chat_port: u16,
    /// Setting audio/video ports enables the multi-port variant
    pub audio_port: Option<u16>,
    pub video_port: Option<u16>,
    pub recv_buffer_bytes: usize,
    pub max_stream_frame: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            datagram_port: DEFAULT_DATAGRAM_PORT,
            chat_port: DEFAULT_CHAT_PORT,
            audio_port: None,
            video_port: None,
            recv_buffer_bytes: DEFAULT_RECV_BUFFER_BYTES,
            max_stream_frame: DEFAULT_MAX_STREAM_FRAME,
        }
    }
}

impl NetworkConfig {
    /// Reliable stream ports that are configured, by stream kind
    pub fn stream_ports(&self) -> Vec<(StreamKind, u16)> {
        let mut ports = vec![(StreamKind::Chat, self.chat_port)];
        if let Some(port) = self.audio_port {
            ports.push((StreamKind::Audio, port));
        }
        if let Some(port) = self.video_port {
            ports.push((StreamKind::Video, port));
        }
        ports
    }
}

/// Fan-out, queueing and liveness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub outbound_queue_depth: usize,
    pub chat_queue_depth: usize,
    pub liveness_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub identity: IdentityMode,
    pub framing: RelayFraming,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbound_queue_depth: DEFAULT_QUEUE_DEPTH,
            chat_queue_depth: DEFAULT_CHAT_QUEUE_DEPTH,
            liveness_ttl_ms: DEFAULT_LIVENESS_TTL_MS,
            sweep_interval_ms: 1_000,
            handshake_timeout_ms: 5_000,
            identity: IdentityMode::Handshake,
            framing: RelayFraming::Prefixed,
        }
    }
}

impl RelaySettings {
    /// Outbound queue depth for a stream kind
    pub fn queue_depth(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Chat => self.chat_queue_depth,
            _ => self.outbound_queue_depth,
        }
    }

    pub fn liveness_ttl(&self) -> Duration {
        Duration::from_millis(self.liveness_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Media pacing and buffering, shared by relay and client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub max_fragment_payload: usize,
    pub target_fps: u32,
    pub jitter_depth: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_fragment_payload: DEFAULT_MAX_FRAGMENT_PAYLOAD,
            target_fps: DEFAULT_TARGET_FPS,
            jitter_depth: DEFAULT_JITTER_DEPTH,
        }
    }
}

impl MediaConfig {
    /// Interval between captured frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.target_fps.max(1) as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.max_fragment_payload == 0 {
            return Err(Error::Config("max_fragment_payload must be positive".into()));
        }
        if self.max_fragment_payload + MAX_HEADER_LEN > MAX_DATAGRAM_PAYLOAD {
            return Err(Error::Config(format!(
                "max_fragment_payload {} plus a {}-byte header exceeds the {}-byte datagram limit",
                self.max_fragment_payload, MAX_HEADER_LEN, MAX_DATAGRAM_PAYLOAD
            )));
        }
        if self.target_fps == 0 {
            return Err(Error::Config("target_fps must be positive".into()));
        }
        if self.jitter_depth == 0 {
            return Err(Error::Config("jitter_depth must be positive".into()));
        }
        Ok(())
    }
}

/// Status HTTP API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_STATUS_PORT,
        }
    }
}

/// Relay process configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    pub relay: RelaySettings,
    pub media: MediaConfig,
    pub status: StatusConfig,
}

impl RelayConfig {
    /// Load from `path`, the default location, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load_toml(path, "relay.toml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay.outbound_queue_depth == 0 || self.relay.chat_queue_depth == 0 {
            return Err(Error::Config("queue depths must be positive".into()));
        }
        if self.relay.liveness_ttl_ms == 0 {
            return Err(Error::Config("liveness_ttl_ms must be positive".into()));
        }
        if self.relay.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep_interval_ms must be positive".into()));
        }
        if self.network.max_stream_frame == 0 {
            return Err(Error::Config("max_stream_frame must be positive".into()));
        }
        self.media.validate()
    }
}

/// Peer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub datagram_port: u16,
    pub chat_port: u16,
    pub audio_port: u16,
    pub video_port: u16,
    pub username: String,
    pub media_transport: MediaTransport,
    /// Must match the relay's identity mode
    pub handshake: bool,
    /// Must match the relay's stream framing
    pub framing: RelayFraming,
    /// Interval between hello datagrams that keep the peer registered
    pub keepalive_ms: u64,
    pub event_capacity: usize,
    pub presence_ttl_ms: u64,
    pub recv_buffer_bytes: usize,
    pub max_stream_frame: usize,
    pub media: MediaConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            datagram_port: DEFAULT_DATAGRAM_PORT,
            chat_port: DEFAULT_CHAT_PORT,
            audio_port: DEFAULT_AUDIO_PORT,
            video_port: DEFAULT_VIDEO_PORT,
            username: "guest".to_string(),
            media_transport: MediaTransport::Datagram,
            handshake: true,
            framing: RelayFraming::Prefixed,
            keepalive_ms: 2_000,
            event_capacity: 256,
            presence_ttl_ms: DEFAULT_LIVENESS_TTL_MS,
            recv_buffer_bytes: DEFAULT_RECV_BUFFER_BYTES,
            max_stream_frame: DEFAULT_MAX_STREAM_FRAME,
            media: MediaConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load_toml(path, "client.toml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() || self.username.len() > u8::MAX as usize {
            return Err(Error::Config("username must be 1..=255 bytes".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be positive".into()));
        }
        if self.keepalive_ms == 0 || self.presence_ttl_ms == 0 {
            return Err(Error::Config("keepalive_ms and presence_ttl_ms must be positive".into()));
        }
        self.media.validate()
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

/// Platform config directory for this application
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "locus").map(|dirs| dirs.config_dir().to_path_buf())
}

fn load_toml<T>(path: Option<&Path>, file_name: &str) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match config_dir().map(|dir| dir.join(file_name)) {
            Some(path) if path.exists() => path,
            _ => {
                tracing::debug!("No {} found, using defaults", file_name);
                return Ok(T::default());
            }
        },
    };

    let text = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
    tracing::info!("Loaded configuration from {}", path.display());
    toml::from_str(&text).map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))
}
