//! Datagram fragmentation of encoded media frames
//!
//! # Fragment layout
//!
//! ```text
//! [0]        marker         u8   0xFF
//! [1]        sequence       u8   per-sender frame counter, wraps mod 256
//! [2]        index          u8   0-based fragment index within the frame
//! [3]        total          u8   fragments in this frame (1..=255)
//! [4]        sender_id_len  u8
//! [5..5+n]   sender_id      UTF-8 username
//! [5+n]      flags          u8   bit0 = deaf, bit1 = mute
//! [6+n..]    chunk          payload bytes
//! ```
//!
//! Fragments are sent best-effort and unordered; nothing is retransmitted.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ProtocolError;

/// First byte of every fragment datagram
pub const FRAGMENT_MARKER: u8 = 0xFF;

/// Marker, sequence, index, total and sender id length
pub const FIXED_HEADER_LEN: usize = 5;

/// `total` is a single byte
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// `sender_id_len` is a single byte
pub const MAX_SENDER_ID_LEN: usize = u8::MAX as usize;

/// Largest header a fragment can carry (longest sender id plus flags byte)
pub const MAX_HEADER_LEN: usize = FIXED_HEADER_LEN + MAX_SENDER_ID_LEN + 1;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507;

/// Mute/deaf state carried in every fragment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaFlags(u8);

impl MediaFlags {
    pub const DEAF: u8 = 0b0000_0001;
    pub const MUTE: u8 = 0b0000_0010;

    pub fn new(mute: bool, deaf: bool) -> Self {
        let mut bits = 0;
        if mute {
            bits |= Self::MUTE;
        }
        if deaf {
            bits |= Self::DEAF;
        }
        Self(bits)
    }

    /// Build from a wire byte, ignoring unknown bits
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::MUTE | Self::DEAF))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_mute(&self) -> bool {
        self.0 & Self::MUTE != 0
    }

    pub fn is_deaf(&self) -> bool {
        self.0 & Self::DEAF != 0
    }
}

/// One bounded-size piece of an encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub sequence: u8,
    pub index: u8,
    pub total: u8,
    pub sender_id: String,
    pub flags: MediaFlags,
    pub payload: Bytes,
}

impl Fragment {
    /// Header length for this fragment's sender id
    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN + self.sender_id.len() + 1
    }

    /// Serialize into a datagram.
    ///
    /// Fails for fields the header cannot carry: a sender id over 255 bytes
    /// or an index outside `0..total`.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.sender_id.len() > MAX_SENDER_ID_LEN {
            return Err(ProtocolError::SenderIdTooLong(self.sender_id.len()));
        }
        if self.total == 0 || self.index >= self.total {
            return Err(ProtocolError::InvalidIndex {
                index: self.index,
                total: self.total,
            });
        }

        let mut buf = BytesMut::with_capacity(self.header_len() + self.payload.len());
        buf.put_u8(FRAGMENT_MARKER);
        buf.put_u8(self.sequence);
        buf.put_u8(self.index);
        buf.put_u8(self.total);
        buf.put_u8(self.sender_id.len() as u8);
        buf.put_slice(self.sender_id.as_bytes());
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a datagram. The chunk is a zero-copy slice of `data`.
    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(ProtocolError::TruncatedHeader(data.len()));
        }
        if data[0] != FRAGMENT_MARKER {
            return Err(ProtocolError::BadMarker(data[0]));
        }

        let sequence = data[1];
        let index = data[2];
        let total = data[3];
        let id_len = data[4] as usize;

        if total == 0 || index >= total {
            return Err(ProtocolError::InvalidIndex { index, total });
        }

        // sender id plus the flags byte
        let flags_at = FIXED_HEADER_LEN + id_len;
        if data.len() <= flags_at {
            return Err(ProtocolError::TruncatedHeader(data.len()));
        }

        let sender_id = std::str::from_utf8(&data[FIXED_HEADER_LEN..flags_at])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        let flags = MediaFlags::from_bits(data[flags_at]);
        let payload = data.slice(flags_at + 1..);

        Ok(Self {
            sequence,
            index,
            total,
            sender_id,
            flags,
            payload,
        })
    }
}

/// Splits encoded frames into fragments for one sender.
///
/// The sequence counter advances exactly once per frame, however many
/// fragments the frame needs. It is atomic so a shared fragmenter can be
/// driven from `&self`.
#[derive(Debug)]
pub struct FrameFragmenter {
    sender_id: String,
    max_chunk: usize,
    sequence: AtomicU8,
}

impl FrameFragmenter {
    /// Create a fragmenter emitting chunks of at most `max_chunk` bytes
    pub fn new(sender_id: impl Into<String>, max_chunk: usize) -> Result<Self, ProtocolError> {
        let sender_id = sender_id.into();
        if sender_id.len() > MAX_SENDER_ID_LEN {
            return Err(ProtocolError::SenderIdTooLong(sender_id.len()));
        }

        Ok(Self {
            sender_id,
            max_chunk: max_chunk.max(1),
            sequence: AtomicU8::new(0),
        })
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Sequence number of the last fragmented frame
    pub fn current_sequence(&self) -> u8 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Number of fragments a payload of `len` bytes needs
    pub fn fragment_count(&self, len: usize) -> usize {
        (len + self.max_chunk - 1) / self.max_chunk
    }

    /// Split `payload` into fragments sharing one fresh sequence number.
    ///
    /// An empty payload yields no fragments and leaves the counter alone.
    pub fn fragment(&self, payload: &Bytes, flags: MediaFlags) -> Result<Vec<Fragment>, ProtocolError> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }

        let count = self.fragment_count(payload.len());
        if count > MAX_FRAGMENTS {
            return Err(ProtocolError::PayloadTooLarge { fragments: count });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let total = count as u8;

        let fragments = (0..count)
            .map(|i| {
                let start = i * self.max_chunk;
                let end = (start + self.max_chunk).min(payload.len());
                Fragment {
                    sequence,
                    index: i as u8,
                    total,
                    sender_id: self.sender_id.clone(),
                    flags,
                    payload: payload.slice(start..end),
                }
            })
            .collect();

        Ok(fragments)
    }

    /// Fragment and serialize in one step
    pub fn fragment_datagrams(&self, payload: &Bytes, flags: MediaFlags) -> Result<Vec<Bytes>, ProtocolError> {
        self.fragment(payload, flags)?
            .iter()
            .map(Fragment::encode)
            .collect()
    }
}
