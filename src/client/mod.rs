//! Peer-side transport
//!
//! [`RelayClient`] owns the peer's sockets. Capture and rendering stay
//! outside: frames come in through [`FrameSource`] or the `send_*` calls,
//! and everything received comes back as [`ClientEvent`]s plus audio blocks
//! in the shared jitter buffer.

pub mod inbound;
pub mod presence;
pub mod session;

pub use presence::PresenceTracker;
pub use session::RelayClient;

use bytes::Bytes;

/// Something the peer received from the meeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A user was seen for the first time, or again after leaving
    Joined { user: String },
    /// A complete encoded video frame
    Video {
        user: String,
        frame: Bytes,
        mute: bool,
        deaf: bool,
    },
    /// The user's camera is off
    CameraOff { user: String, mute: bool, deaf: bool },
    Chat { user: String, text: String },
    /// The user has been silent longer than the presence TTL
    Left { user: String },
}

impl ClientEvent {
    pub fn user(&self) -> &str {
        match self {
            ClientEvent::Joined { user }
            | ClientEvent::Video { user, .. }
            | ClientEvent::CameraOff { user, .. }
            | ClientEvent::Chat { user, .. }
            | ClientEvent::Left { user } => user,
        }
    }
}

/// Source of encoded frames for [`RelayClient::run_video`]
pub trait FrameSource: Send {
    /// Next encoded frame, or `None` while the camera is off
    fn next_frame(&mut self) -> Option<Bytes>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Option<Bytes> + Send,
{
    fn next_frame(&mut self) -> Option<Bytes> {
        self()
    }
}
