//! Bencode decoding over an in-memory byte slice.
//!
//! The decoder walks the input with an explicit cursor and an explicit
//! container stack. Lists and dictionaries are parsed iteratively rather
//! than by recursion, so adversarial inputs of the form `llllll...` cannot
//! exhaust the call stack.
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use super::Dict;
use tracing::instrument;

/// Cursor over the raw input bytes.
///
/// Keeps the current offset so error values can report where decoding
/// stopped and so the top-level entry point can detect trailing garbage.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn bump(&mut self) -> BencodeResult<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Decodes a bencode string in the format `<length>:<data>`.
///
/// The length prefix must be a plain decimal with no sign and no leading
/// zeros (`0:` itself is the only length starting with a zero digit).
///
/// # Example
/// For input "5:hello", this function returns the bytes `hello`.
#[instrument(skip(cur), level = "trace")]
fn decode_string(cur: &mut Cursor<'_>) -> BencodeResult<Vec<u8>> {
    let mut digits = Vec::new();
    loop {
        match cur.bump()? {
            b':' => break,
            byte @ b'0'..=b'9' => digits.push(byte),
            _ => return Err(BencodeError::StringLength),
        }
    }

    if digits.is_empty() || (digits.len() > 1 && digits[0] == b'0') {
        return Err(BencodeError::StringLength);
    }

    // digits is ASCII by construction
    let length = std::str::from_utf8(&digits)
        .expect("length digits are ASCII")
        .parse::<usize>()
        .map_err(|_| BencodeError::StringLength)?;

    cur.take(length).map(|bytes| bytes.to_vec())
}

/// Decodes a bencode integer in the format `i<number>e`.
///
/// The function performs several validations:
/// - Rejects leading zeros (the single token `i0e` is the only value whose
///   digits start with a zero)
/// - Rejects "-0"
/// - Rejects an empty number and a bare "-"
///
/// # Example
/// For input "i42e", this function returns Ok(42).
#[instrument(skip(cur), level = "trace")]
fn decode_integer(cur: &mut Cursor<'_>) -> BencodeResult<i64> {
    let first_byte = cur.bump()?;
    debug_assert_eq!(first_byte, b'i');

    let mut digits = Vec::new();
    loop {
        match cur.bump()? {
            b'e' => break,
            byte => digits.push(byte),
        }
    }

    let unsigned = match digits.split_first() {
        None => return Err(BencodeError::IntegerFormat),
        Some((b'-', rest)) => {
            if rest.is_empty() || rest == b"0" {
                return Err(BencodeError::IntegerFormat);
            }
            rest
        }
        Some(_) => &digits[..],
    };

    if unsigned.iter().any(|b| !b.is_ascii_digit()) {
        return Err(BencodeError::IntegerFormat);
    }
    if unsigned.len() > 1 && unsigned[0] == b'0' {
        return Err(BencodeError::IntegerFormat);
    }

    std::str::from_utf8(&digits)
        .expect("integer digits are ASCII")
        .parse::<i64>()
        .map_err(|_| BencodeError::IntegerFormat)
}

/// One partially built container on the explicit parse stack.
enum Frame {
    List(Vec<BencodeValue>),
    Dict {
        dict: Dict,
        /// Key already decoded and waiting for its value.
        pending_key: Option<Vec<u8>>,
    },
}

/// Decodes the next complete value starting at the cursor.
///
/// Containers are handled with an explicit stack: opening `l`/`d` pushes a
/// frame, a matching `e` pops it, and every completed value is attached to
/// the frame below it (or returned when the stack is empty).
fn decode_value(cur: &mut Cursor<'_>) -> BencodeResult<BencodeValue> {
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        // A dictionary frame without a pending key expects a key or the
        // closing 'e'; everything else expects a value.
        let expects_key = matches!(
            stack.last(),
            Some(Frame::Dict {
                pending_key: None,
                ..
            })
        );

        let completed = if expects_key {
            match cur.peek()? {
                b'e' => {
                    cur.bump()?;
                    match stack.pop() {
                        Some(Frame::Dict { dict, .. }) => Some(BencodeValue::Dict(dict)),
                        _ => unreachable!("dict frame checked above"),
                    }
                }
                b'0'..=b'9' => {
                    let key = decode_string(cur)?;
                    match stack.last_mut() {
                        Some(Frame::Dict { dict, pending_key }) => {
                            if let Some(last) = dict.last_key() {
                                if key.as_slice() <= last {
                                    return Err(BencodeError::DictKeyOrder);
                                }
                            }
                            *pending_key = Some(key);
                        }
                        _ => unreachable!("dict frame checked above"),
                    }
                    None
                }
                _ => return Err(BencodeError::DictKeyType),
            }
        } else {
            match cur.peek()? {
                b'0'..=b'9' => Some(BencodeValue::String(decode_string(cur)?)),
                b'i' => Some(BencodeValue::Integer(decode_integer(cur)?)),
                b'l' => {
                    cur.bump()?;
                    stack.push(Frame::List(Vec::new()));
                    None
                }
                b'd' => {
                    cur.bump()?;
                    stack.push(Frame::Dict {
                        dict: Dict::new(),
                        pending_key: None,
                    });
                    None
                }
                b'e' if matches!(stack.last(), Some(Frame::List(_))) => {
                    cur.bump()?;
                    match stack.pop() {
                        Some(Frame::List(items)) => Some(BencodeValue::List(items)),
                        _ => unreachable!("list frame checked above"),
                    }
                }
                byte => return Err(BencodeError::UnrecognizedToken(byte, cur.pos)),
            }
        };

        if let Some(value) = completed {
            match stack.last_mut() {
                None => return Ok(value),
                Some(Frame::List(items)) => items.push(value),
                Some(Frame::Dict { dict, pending_key }) => {
                    let key = pending_key.take().expect("value only parsed after a key");
                    dict.push_unchecked(key, value);
                }
            }
        }
    }
}

/// Decodes a complete bencoded value from `data`.
///
/// The entire input must be consumed; leftover bytes after the top-level
/// value fail with [`BencodeError::TrailingGarbage`]. This strictness is
/// what lets the metainfo parser trust that re-encoding reproduces the
/// original byte range of the `info` dictionary.
///
/// # Example
/// For input `d3:cow3:mooe` this returns a dictionary mapping `cow` to the
/// string `moo`.
#[instrument(skip(data), level = "debug")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cur = Cursor::new(data);
    let value = decode_value(&mut cur)?;
    if !cur.is_exhausted() {
        return Err(BencodeError::TrailingGarbage);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    fn decode_ok(input: &[u8]) -> BencodeValue {
        decode(input).expect("input should decode")
    }

    #[test]
    fn decodes_strings() {
        assert_eq!(decode_ok(b"4:spam"), BencodeValue::String(b"spam".to_vec()));
        assert_eq!(decode_ok(b"0:"), BencodeValue::String(Vec::new()));
    }

    #[test]
    fn rejects_bad_string_lengths() {
        assert_eq!(decode(b"04:spam"), Err(BencodeError::StringLength));
        assert_eq!(decode(b"5x:spam"), Err(BencodeError::StringLength));
        assert_eq!(decode(b"5:spam"), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(decode_ok(b"i0e"), BencodeValue::Integer(0));
        assert_eq!(decode_ok(b"i-42e"), BencodeValue::Integer(-42));
        assert_eq!(
            decode_ok(b"i9223372036854775807e"),
            BencodeValue::Integer(i64::MAX)
        );
    }

    #[test]
    fn rejects_malformed_integers() {
        assert_eq!(decode(b"i03e"), Err(BencodeError::IntegerFormat));
        assert_eq!(decode(b"i-0e"), Err(BencodeError::IntegerFormat));
        assert_eq!(decode(b"i e"), Err(BencodeError::IntegerFormat));
        assert_eq!(decode(b"ie"), Err(BencodeError::IntegerFormat));
        assert_eq!(decode(b"i-e"), Err(BencodeError::IntegerFormat));
    }

    #[test]
    fn decodes_nested_containers() {
        let value = decode_ok(b"d3:cow3:moo4:spaml1:a1:bee");
        let dict = value.as_dict().expect("dict");
        assert_eq!(dict.get(b"cow").and_then(|v| v.as_str()), Some(&b"moo"[..]));
        let spam = dict.get(b"spam").and_then(|v| v.as_list()).expect("list");
        assert_eq!(spam.len(), 2);
        assert_eq!(spam[0], BencodeValue::String(b"a".to_vec()));
    }

    #[test]
    fn round_trips_canonical_input() {
        let input = b"d3:cow3:moo4:spaml1:a1:bee";
        let value = decode_ok(input);
        let mut out = Vec::new();
        encode(&mut out, &value).expect("encode");
        assert_eq!(out, input);
    }

    #[test]
    fn rejects_out_of_order_dict_keys() {
        assert_eq!(
            decode(b"d4:spam1:a3:cow3:mooe"),
            Err(BencodeError::DictKeyOrder)
        );
        // duplicate keys are not strictly ascending either
        assert_eq!(
            decode(b"d3:cow1:a3:cow1:be"),
            Err(BencodeError::DictKeyOrder)
        );
    }

    #[test]
    fn rejects_non_string_dict_keys() {
        assert_eq!(decode(b"di1e3:mooe"), Err(BencodeError::DictKeyType));
        assert_eq!(decode(b"dl1:ae3:mooe"), Err(BencodeError::DictKeyType));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert_eq!(decode(b"i42ei43e"), Err(BencodeError::TrailingGarbage));
        assert_eq!(decode(b"4:spamx"), Err(BencodeError::TrailingGarbage));
    }

    #[test]
    fn rejects_unrecognized_leading_token() {
        assert!(matches!(
            decode(b"x42e"),
            Err(BencodeError::UnrecognizedToken(b'x', 0))
        ));
        // a dict value may not start with 'e'
        assert!(matches!(
            decode(b"d3:cowe"),
            Err(BencodeError::UnrecognizedToken(b'e', _))
        ));
    }

    #[test]
    fn rejects_truncated_containers() {
        assert_eq!(decode(b"l4:spam"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"d3:cow3:moo"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b""), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn deep_nesting_does_not_recurse() {
        let mut input = Vec::new();
        input.extend(std::iter::repeat(b'l').take(100_000));
        input.extend(std::iter::repeat(b'e').take(100_000));
        let mut value = decode(&input).expect("deeply nested lists decode");
        // dismantle iteratively; a plain drop of the nested value would
        // recurse as deeply as the input
        let mut depth = 0usize;
        while let BencodeValue::List(mut items) = value {
            depth += 1;
            value = items.pop().unwrap_or(BencodeValue::Integer(0));
        }
        assert_eq!(depth, 100_000);
    }
}
