//! Datagram dispatch
//!
//! Fragments and control messages share one datagram channel; the first byte
//! tells them apart.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ProtocolError;
use crate::protocol::control::ControlMessage;
use crate::protocol::fragment::{Fragment, FRAGMENT_MARKER};

/// A parsed datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Fragment(Fragment),
    Control(ControlMessage),
}

impl Datagram {
    /// Username the datagram was sent under
    pub fn user(&self) -> &str {
        match self {
            Datagram::Fragment(fragment) => &fragment.sender_id,
            Datagram::Control(msg) => msg.user(),
        }
    }
}

/// Classify and parse one datagram
pub fn classify(data: Bytes) -> Result<Datagram, ProtocolError> {
    match data.first() {
        None => Err(ProtocolError::TruncatedHeader(0)),
        Some(&FRAGMENT_MARKER) => Fragment::decode(data).map(Datagram::Fragment),
        Some(_) => ControlMessage::decode(&data).map(Datagram::Control),
    }
}

/// Routes datagrams and keeps per-class counters.
///
/// Malformed input is dropped here and only counted; it never reaches the
/// relay or the reassembler.
#[derive(Debug, Default)]
pub struct ControlDispatcher {
    fragments: AtomicU64,
    control: AtomicU64,
    malformed: AtomicU64,
}

impl ControlDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a datagram, returning `None` for anything malformed
    pub fn dispatch(&self, data: Bytes) -> Option<Datagram> {
        match classify(data) {
            Ok(datagram) => {
                let counter = match datagram {
                    Datagram::Fragment(_) => &self.fragments,
                    Datagram::Control(_) => &self.control,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                Some(datagram)
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropping malformed datagram: {}", e);
                None
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            fragments: self.fragments.load(Ordering::Relaxed),
            control: self.control.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    pub fragments: u64,
    pub control: u64,
    pub malformed: u64,
}
