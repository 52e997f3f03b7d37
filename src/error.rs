//! Error types for the relay and its peers

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire format errors.
///
/// On the datagram path these are transient: the unit is dropped and counted,
/// the sender's session is untouched. On a reliable stream they close that
/// one connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated header: {0} bytes")]
    TruncatedHeader(usize),

    #[error("Bad fragment marker: {0:#04x}")]
    BadMarker(u8),

    #[error("Invalid fragment index {index} of {total}")]
    InvalidIndex { index: u8, total: u8 },

    #[error("Sender id is not valid UTF-8")]
    InvalidUtf8,

    #[error("Sender id too long: {0} bytes")]
    SenderIdTooLong(usize),

    #[error("Unknown control tag: {0}")]
    UnknownTag(u32),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Stream frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Payload needs {fragments} fragments (max 255)")]
    PayloadTooLarge { fragments: usize },
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
