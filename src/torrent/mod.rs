//! Torrent metainfo parsing and error handling logic.
//!
//! This module provides types and error handling for working with .torrent
//! files, including parsing, validation, and error reporting.
use thiserror::Error;

pub mod file;
pub mod info_hash;

pub use file::{FileDict, InfoDict, TorrentFile};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("File lengths do not agree with piece count: total {total}, {num_pieces} pieces of {piece_length}")]
    LengthMismatch {
        total: i64,
        num_pieces: usize,
        piece_length: i64,
    },

    #[error("Date parse error")]
    DateParseError,
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
