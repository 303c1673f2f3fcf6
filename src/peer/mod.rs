//! Peer wire protocol: handshake framing, message codec, and per-peer
//! connection state.
use thiserror::Error;

pub mod connection;
pub mod handshake;
pub mod message;

pub use connection::{Direction, PeerConn};
pub use handshake::Handshake;
pub use message::{Message, MessageCodec};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: Invalid protocol identifier")]
    HandshakeInvalidProtocol,

    #[error("Handshake failed: Info hash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("Frame length {0} exceeds sanity cap")]
    FrameTooLarge(usize),

    #[error("Malformed {0} payload")]
    MalformedPayload(&'static str),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
