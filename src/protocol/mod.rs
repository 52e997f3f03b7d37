//! Wire protocol shared by the relay and its peers
//!
//! Two channels exist between a peer and the relay:
//!
//! - the shared datagram channel, carrying video [`fragment`]s (marker `0xFF`)
//!   and serialized [`control`] messages side by side;
//! - reliable streams (chat, and audio/video in the multi-port variant),
//!   carrying length-prefixed [`framing`] frames.

pub mod control;
pub mod dispatch;
pub mod fragment;
pub mod framing;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use control::ControlMessage;
pub use dispatch::{classify, Datagram};
pub use fragment::{Fragment, FrameFragmenter, MediaFlags, FRAGMENT_MARKER};
pub use framing::{read_frame, write_frame, Handshake, RelayPrefix, Welcome};

/// Kind of stream a unit travels on.
///
/// `Datagram` is the shared unreliable channel: presence and mute-state
/// control traffic, audio sample blocks and video fragments all use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
    Chat,
    Datagram,
}

impl StreamKind {
    /// Stream kinds carried over reliable connections
    pub const RELIABLE: [StreamKind; 3] = [StreamKind::Audio, StreamKind::Video, StreamKind::Chat];

    /// Whether this kind is carried by a reliable stream connection
    pub fn is_reliable(&self) -> bool {
        !matches!(self, StreamKind::Datagram)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Chat => "chat",
            StreamKind::Datagram => "datagram",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_reliability() {
        for kind in StreamKind::RELIABLE {
            assert!(kind.is_reliable());
        }
        assert!(!StreamKind::Datagram.is_reliable());
    }

    #[test]
    fn test_stream_kind_serde_names() {
        let json = serde_json::to_string(&StreamKind::Chat).unwrap();
        assert_eq!(json, "\"chat\"");
        let kind: StreamKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(kind, StreamKind::Video);
    }
}
