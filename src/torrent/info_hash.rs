//! Info-hash computation.
//!
//! The info-hash is the SHA-1 of the bencoded `info` dictionary and is the
//! identity of the torrent in handshakes and tracker announces. Because the
//! decoded dictionary preserves its source key order and the encoder emits
//! entries in that order, re-encoding reproduces the exact byte range of the
//! source file and the hash is stable.
use crate::bencode::encoder;
use crate::bencode::{BencodeValue, Dict};
use sha1::Digest;
use sha1::Sha1;

/// Calculates the SHA-1 hash of a bencode-encoded info dictionary.
///
/// # Arguments
/// * `info_dict` - The parsed `info` dictionary of the torrent
///
/// # Returns
/// * `[u8; 20]` - the 20-byte SHA-1 digest of the re-encoded dictionary
pub fn calculate_info_hash(info_dict: &Dict) -> [u8; 20] {
    let buffer = encoder::encode_to_vec(&BencodeValue::Dict(info_dict.clone()));

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);
    info_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;

    #[test]
    fn matches_sha1_of_original_info_span() {
        // the exact byte span of the info dict inside a metainfo file
        let mut info_span = Vec::new();
        info_span.extend_from_slice(b"d6:lengthi12345e4:name4:test12:piece lengthi16384e6:pieces20:");
        info_span.extend_from_slice(&[0x42u8; 20]);
        info_span.extend_from_slice(b"e");

        let expected: [u8; 20] = Sha1::digest(&info_span).into();

        let parsed = decode(&info_span).expect("decode info dict");
        let dict = parsed.as_dict().expect("dict");
        assert_eq!(calculate_info_hash(dict), expected);
    }

    #[test]
    fn hash_is_stable_across_reparse() {
        let raw = b"d3:fooi1e3:zar3:babe";
        let dict_a = decode(raw).expect("decode");
        let reencoded = crate::bencode::encoder::encode_to_vec(&dict_a);
        let dict_b = decode(&reencoded).expect("decode again");
        assert_eq!(
            calculate_info_hash(dict_a.as_dict().unwrap()),
            calculate_info_hash(dict_b.as_dict().unwrap())
        );
    }
}
