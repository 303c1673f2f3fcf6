//! Request scheduling.
//!
//! The consumer (the reactor, on behalf of one peer) asks for the next
//! request and receives `None` when nothing is available for that peer.
//! Selection is strictly sequential: lowest piece index first, lowest block
//! offset within the piece, which keeps the policy deterministic and easy
//! to reason about under test.
use super::store::PieceStore;
use super::{BlockRequest, BlockState, Bitfield, PieceState};

/// Per-peer cap on outstanding block requests.
pub const MAX_INFLIGHT: usize = 5;

impl PieceStore {
    /// Picks the next (piece, block) to request from a peer advertising
    /// `peer_bitfield`, given that the peer already has `inflight`
    /// outstanding requests.
    ///
    /// Walks pieces in ascending index, skipping verified ones and ones the
    /// peer does not have, and returns the first Missing block by ascending
    /// offset. Returns `None` at the inflight cap or when the peer has
    /// nothing we still need. The caller must follow up with
    /// [`PieceStore::mark_requested`] once the Request message is actually
    /// sent; until then the block stays Missing.
    pub fn next_request(&self, peer_bitfield: &Bitfield, inflight: usize) -> Option<BlockRequest> {
        if inflight >= MAX_INFLIGHT {
            return None;
        }
        for piece in self.pieces() {
            if piece.state == PieceState::Verified {
                continue;
            }
            if !peer_bitfield.has(piece.index) {
                continue;
            }
            if let Some(block) = piece
                .blocks
                .iter()
                .find(|b| b.state == BlockState::Missing)
            {
                return Some(BlockRequest {
                    index: piece.index,
                    begin: block.offset,
                    length: block.length,
                });
            }
        }
        None
    }

    /// Whether the peer advertising `field` has any piece we still lack.
    /// Drives the Interested / NotInterested transitions; unlike
    /// [`Self::next_request`] it ignores in-flight state, since a piece
    /// whose blocks are all requested elsewhere may still fail or time out.
    pub fn wants_from(&self, field: &Bitfield) -> bool {
        self.pieces()
            .iter()
            .any(|p| p.state != PieceState::Verified && field.has(p.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BLOCK_SIZE;
    use crate::torrent::TorrentFile;
    use sha1::{Digest, Sha1};
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "10.0.0.1:6881".parse().unwrap()
    }

    fn store_with_pieces(num_pieces: usize, piece_length: i64) -> PieceStore {
        let total = num_pieces as i64 * piece_length;
        let data = vec![0u8; total as usize];
        let digest: [u8; 20] = Sha1::digest(&data[..piece_length as usize]).into();
        let mut hashes = Vec::new();
        for _ in 0..num_pieces {
            hashes.extend_from_slice(&digest);
        }

        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce20:http://t.example/ann4:infod6:length");
        raw.extend_from_slice(format!("i{}e", total).as_bytes());
        raw.extend_from_slice(b"4:name8:test.bin12:piece length");
        raw.extend_from_slice(format!("i{}e", piece_length).as_bytes());
        raw.extend_from_slice(format!("6:pieces{}:", hashes.len()).as_bytes());
        raw.extend_from_slice(&hashes);
        raw.extend_from_slice(b"ee");
        PieceStore::new(&TorrentFile::from_bytes(&raw).expect("parse"))
    }

    fn full_bitfield(n: usize) -> Bitfield {
        let mut field = Bitfield::new(n);
        for i in 0..n {
            field.set(i as u32);
        }
        field
    }

    #[test]
    fn selects_in_piece_then_offset_order() {
        let mut store = store_with_pieces(2, 2 * BLOCK_SIZE as i64);
        let field = full_bitfield(2);

        let first = store.next_request(&field, 0).unwrap();
        assert_eq!((first.index, first.begin, first.length), (0, 0, BLOCK_SIZE));

        store.mark_requested(peer(), first.index, first.begin);
        let second = store.next_request(&field, 1).unwrap();
        assert_eq!((second.index, second.begin), (0, BLOCK_SIZE));

        store.mark_requested(peer(), second.index, second.begin);
        let third = store.next_request(&field, 2).unwrap();
        assert_eq!((third.index, third.begin), (1, 0));
    }

    #[test]
    fn respects_peer_bitfield() {
        let store = store_with_pieces(3, BLOCK_SIZE as i64);
        let mut field = Bitfield::new(3);
        field.set(2);

        let req = store.next_request(&field, 0).unwrap();
        assert_eq!(req.index, 2);

        let empty = Bitfield::new(3);
        assert!(store.next_request(&empty, 0).is_none());
    }

    #[test]
    fn respects_inflight_cap() {
        let store = store_with_pieces(2, 2 * BLOCK_SIZE as i64);
        let field = full_bitfield(2);
        assert!(store.next_request(&field, MAX_INFLIGHT).is_none());
        assert!(store.next_request(&field, MAX_INFLIGHT - 1).is_some());
    }

    #[test]
    fn requested_block_is_not_reissued_until_released() {
        let mut store = store_with_pieces(1, BLOCK_SIZE as i64);
        let field = full_bitfield(1);

        let req = store.next_request(&field, 0).unwrap();
        store.mark_requested(peer(), req.index, req.begin);
        // single block in the torrent, now outstanding on a peer
        assert!(store.next_request(&field, 0).is_none());

        store.mark_timed_out(req.index, req.begin);
        let again = store.next_request(&field, 0).unwrap();
        assert_eq!(again, req);
    }
}
