//! Control messages
//!
//! A closed set of records exchanged next to media: presence announcements,
//! camera-off/mute notices, audio sample blocks, chat lines and (on a reliable
//! video stream) whole video frames.
//!
//! Encoding is bincode. Its leading 4-byte little-endian variant tag keeps the
//! first byte of every encoded message well away from the fragment marker.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Number of variants in [`ControlMessage`]
const VARIANT_COUNT: u32 = 5;

/// Control record exchanged between peers through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Presence announcement, sent on join
    Hello { user: String },

    /// Camera is off; carries the current mute/deaf state
    Offcam { user: String, mute: bool, deaf: bool },

    /// Block of raw 16-bit PCM samples
    Audio { user: String, samples: Vec<u8> },

    /// Chat line
    Chat { user: String, text: String },

    /// Whole encoded video frame (reliable video stream only)
    Video {
        user: String,
        mute: bool,
        deaf: bool,
        frame: Vec<u8>,
    },
}

impl ControlMessage {
    /// Username of the peer that produced the message
    pub fn user(&self) -> &str {
        match self {
            ControlMessage::Hello { user }
            | ControlMessage::Offcam { user, .. }
            | ControlMessage::Audio { user, .. }
            | ControlMessage::Chat { user, .. }
            | ControlMessage::Video { user, .. } => user,
        }
    }

    /// Short name of the message type, for logs
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Offcam { .. } => "offcam",
            ControlMessage::Audio { .. } => "audio",
            ControlMessage::Chat { .. } => "chat",
            ControlMessage::Video { .. } => "video",
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a message, rejecting unknown type tags before touching the body
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let tag_bytes: [u8; 4] = data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::TruncatedHeader(data.len()))?;

        let tag = u32::from_le_bytes(tag_bytes);
        if tag >= VARIANT_COUNT {
            return Err(ProtocolError::UnknownTag(tag));
        }

        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAGMENT_MARKER;

    fn all_variants() -> Vec<ControlMessage> {
        vec![
            ControlMessage::Hello { user: "ana".into() },
            ControlMessage::Offcam { user: "ana".into(), mute: true, deaf: false },
            ControlMessage::Audio { user: "ana".into(), samples: vec![1, 2, 3, 4] },
            ControlMessage::Chat { user: "ana".into(), text: "halo".into() },
            ControlMessage::Video {
                user: "ana".into(),
                mute: false,
                deaf: true,
                frame: vec![0xFF, 0xD8, 0xFF],
            },
        ]
    }

    #[test]
    fn test_encode_decode() {
        for msg in all_variants() {
            let wire = msg.encode().unwrap();
            assert_eq!(ControlMessage::decode(&wire).unwrap(), msg);
        }
    }

    #[test]
    fn test_never_looks_like_a_fragment() {
        for msg in all_variants() {
            let wire = msg.encode().unwrap();
            assert_ne!(wire[0], FRAGMENT_MARKER, "{} starts with marker", msg.type_name());
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut wire = ControlMessage::Hello { user: "ana".into() }.encode().unwrap().to_vec();
        wire[..4].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(ControlMessage::decode(&wire), Err(ProtocolError::UnknownTag(9)));
    }

    #[test]
    fn test_truncated_rejected() {
        assert_eq!(
            ControlMessage::decode(&[0, 0]),
            Err(ProtocolError::TruncatedHeader(2))
        );

        let wire = ControlMessage::Chat { user: "ana".into(), text: "halo".into() }
            .encode()
            .unwrap();
        let cut = &wire[..wire.len() - 2];
        assert!(matches!(ControlMessage::decode(cut), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_user_accessor() {
        for msg in all_variants() {
            assert_eq!(msg.user(), "ana");
        }
    }
}
