//! Bencode codec for the BitTorrent protocol.
//!
//! Bencode is the serialization format used by `.torrent` metainfo files and
//! tracker announce responses. It has exactly four shapes: byte strings,
//! integers, lists, and dictionaries with byte-string keys.
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::decode;
pub use encoder::encode;

/**
 * Represents a Bencode value, the core data structure of the Bencode
 * encoding format.
 *
 * The enum contains four variants covering all possible Bencode data types:
 *
 * 1. String(Vec<u8>):
 *    - Represents a byte string in Bencode
 *    - Stored as raw bytes (Vec<u8>) rather than UTF-8 strings
 *    - Example: "4:spam" in Bencode becomes String(b"spam")
 *
 * 2. Integer(i64):
 *    - Represents a 64-bit signed integer
 *    - Bencode integers are prefixed with 'i' and suffixed with 'e'
 *    - Example: "i42e" in Bencode becomes Integer(42)
 *
 * 3. List(Vec<BencodeValue>):
 *    - Represents an ordered sequence of Bencode values
 *    - Lists are prefixed with 'l' and suffixed with 'e'
 *    - Example: "l4:spami42ee" becomes List([String(b"spam"), Integer(42)])
 *
 * 4. Dict(Dict):
 *    - Represents a key-value mapping where keys are byte strings
 *    - Dictionaries are prefixed with 'd' and suffixed with 'e'
 *    - Key order is preserved exactly as decoded, which keeps re-encoding
 *      byte-identical to the source. The decoder rejects inputs whose keys
 *      are not strictly ascending, so stored order is always lexicographic.
 */
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(Dict),
}

impl BencodeValue {
    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// An order-preserving bencode dictionary.
///
/// Entries are kept in the order they were decoded. Because the decoder
/// enforces strictly ascending keys, that order is also the canonical
/// lexicographic order the encoder must emit, so `encode(decode(x)) == x`
/// holds for dictionaries without any re-sorting.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Dict {
    entries: Vec<(Vec<u8>, BencodeValue)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a value by key.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v)
    }

    /// Removes and returns the value for `key`, if present.
    pub fn remove(&mut self, key: &[u8]) -> Option<BencodeValue> {
        let idx = self.entries.iter().position(|(k, _)| k.as_slice() == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Inserts a key-value pair keeping entries sorted by key. Replaces any
    /// existing entry with the same key.
    pub fn insert(&mut self, key: Vec<u8>, value: BencodeValue) {
        match self
            .entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key.as_slice()))
        {
            Ok(idx) => self.entries[idx] = (key, value),
            Err(idx) => self.entries.insert(idx, (key, value)),
        }
    }

    /// Appends an entry without re-sorting. The decoder uses this after it
    /// has already verified the key is strictly greater than its
    /// predecessor.
    pub(crate) fn push_unchecked(&mut self, key: Vec<u8>, value: BencodeValue) {
        self.entries.push((key, value));
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.entries.last().map(|(k, _)| k.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &BencodeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Custom error type for Bencode operations.
///
/// Each variant names one way an input can be malformed, so callers can
/// distinguish a syntactically broken metainfo from, say, a dictionary whose
/// key order would make the info-hash ambiguous.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unrecognized token {0:#04x} at offset {1}")]
    UnrecognizedToken(u8, usize),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer format")]
    IntegerFormat,

    #[error("invalid string length")]
    StringLength,

    #[error("dictionary keys not in strictly ascending order")]
    DictKeyOrder,

    #[error("dictionary key is not a byte string")]
    DictKeyType,

    #[error("trailing garbage after top-level value")]
    TrailingGarbage,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
