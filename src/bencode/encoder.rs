//! Bencode encoding.
//!
//! The encoder is the exact inverse of the decoder: byte strings as
//! `len:bytes`, integers as `i<decimal>e`, lists as `l…e`, dictionaries as
//! `d…e` with keys emitted in their stored order. Since decoded
//! dictionaries preserve their (validated, lexicographic) source order,
//! `encode(decode(x)) == x` for every valid input, which is what keeps the
//! info-hash stable.
use super::BencodeValue;
use super::Dict;
use std::io::{self, Write};
use tracing::instrument;

/// Encodes a byte slice as a bencode string.
///
/// # Example Output
/// For input: b"hello"
/// Output: "5:hello"
#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> io::Result<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

/// Encodes an integer as a bencode integer.
///
/// # Example Output
/// For input: 42
/// Output: "i42e"
#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> io::Result<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

/// Encodes a slice of BencodeValue as a bencode list.
///
/// # Example Output
/// For input: [1, "hello"]
/// Output: "li1e5:helloe"
#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> io::Result<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a dictionary, emitting entries in stored order.
///
/// # Example Output
/// For input: {"key": 42}
/// Output: "d3:keyi42ee"
#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &Dict) -> io::Result<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict.iter() {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> io::Result<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes a BencodeValue into its bencode representation.
#[instrument(skip(writer, value), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> io::Result<()> {
    encode_value(writer, value)
}

/// Encodes a value into a fresh byte vector.
pub fn encode_to_vec(value: &BencodeValue) -> Vec<u8> {
    let mut buffer = Vec::new();
    encode(&mut buffer, value).expect("writing to a Vec cannot fail");
    buffer
}
