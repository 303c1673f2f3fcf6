//! The piece store: the single owner of all piece and block state.
//!
//! The store is mutated only by the reactor task. Blocks arrive through
//! [`PieceStore::record_block`], which copies them into the piece's assembly
//! buffer and verifies the SHA-1 once the piece is complete. Verified piece
//! buffers are moved out to the file sink so resident memory stays bounded
//! by one piece length per assembling piece.
use super::{Bitfield, Block, BlockOutcome, BlockState, Piece, PieceState, BLOCK_SIZE};
use crate::torrent::TorrentFile;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Piece>,
    total_length: u64,
    downloaded: u64,
    uploaded: u64,
    left: u64,
}

impl PieceStore {
    /// Builds the piece × block grid from the parsed metainfo.
    pub fn new(torrent: &TorrentFile) -> Self {
        let pieces = torrent
            .pieces_hash
            .iter()
            .enumerate()
            .map(|(i, &hash)| Piece::new(i as u32, torrent.piece_size(i) as u32, hash))
            .collect();
        let total_length = torrent.total_length() as u64;
        Self {
            pieces,
            total_length,
            downloaded: 0,
            uploaded: 0,
            left: total_length,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub(crate) fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece_length(&self, index: u32) -> Option<u32> {
        self.pieces.get(index as usize).map(|p| p.length)
    }

    /// Whether the piece is downloaded and verified, i.e. we can serve it.
    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.state == PieceState::Verified)
    }

    pub fn is_complete(&self) -> bool {
        self.left == 0
    }

    /// Packed MSB-first bitfield of verified pieces, for the Bitfield
    /// message sent right after the handshake.
    pub fn have_bitfield(&self) -> Bitfield {
        let mut field = Bitfield::new(self.pieces.len());
        for piece in &self.pieces {
            if piece.state == PieceState::Verified {
                field.set(piece.index);
            }
        }
        field
    }

    /// Records a received block.
    ///
    /// The block must correspond to a declared (offset, length) slot of the
    /// piece and must currently be outstanding, otherwise it is `Rejected`
    /// (duplicate, late, or fabricated). When the block completes its piece
    /// the SHA-1 is checked immediately: a match is reported as
    /// `PieceVerified` (fetch the data with [`Self::take_piece_data`]), a
    /// mismatch resets every block to Missing and reports `PieceFailed`.
    pub fn record_block(&mut self, index: u32, offset: u32, data: &[u8]) -> BlockOutcome {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return BlockOutcome::Rejected;
        };
        if piece.state == PieceState::Verified {
            return BlockOutcome::Rejected;
        }
        if offset % BLOCK_SIZE != 0 {
            return BlockOutcome::Rejected;
        }

        let block_idx = (offset / BLOCK_SIZE) as usize;
        let Some(block) = piece.blocks.get(block_idx) else {
            return BlockOutcome::Rejected;
        };
        if block.state != BlockState::Requested || block.length as usize != data.len() {
            return BlockOutcome::Rejected;
        }

        if piece.buffer_mut().is_empty() {
            *piece.buffer_mut() = vec![0u8; piece.length as usize];
            piece.state = PieceState::Assembling;
        }
        let start = offset as usize;
        piece.buffer_mut()[start..start + data.len()].copy_from_slice(data);
        let block = &mut piece.blocks[block_idx];
        block.state = BlockState::Received;
        block.requested_at = None;

        if piece
            .blocks
            .iter()
            .any(|b| b.state != BlockState::Received)
        {
            return BlockOutcome::Accepted;
        }

        // Piece complete: verify.
        let digest: [u8; 20] = Sha1::digest(&piece.buffer_mut()[..]).into();
        if digest == piece.expected_sha1 {
            piece.state = PieceState::Verified;
            for block in &mut piece.blocks {
                block.requested_from = None;
            }
            self.downloaded += piece.length as u64;
            self.left -= piece.length as u64;
            info!(piece = index, left = self.left, "piece verified");
            BlockOutcome::PieceVerified(index)
        } else {
            piece.state = PieceState::Failed;
            piece.failures += 1;
            piece.take_buffer();
            for block in &mut piece.blocks {
                block.reset();
            }
            warn!(piece = index, failures = piece.failures, "piece hash mismatch");
            BlockOutcome::PieceFailed(index)
        }
    }

    /// Moves a verified piece's data out for the file sink. Returns `None`
    /// if the piece is not verified or its buffer was already taken.
    pub fn take_piece_data(&mut self, index: u32) -> Option<Vec<u8>> {
        let piece = self.pieces.get_mut(index as usize)?;
        if piece.state != PieceState::Verified {
            return None;
        }
        let data = piece.take_buffer();
        if data.is_empty() {
            None
        } else {
            Some(data)
        }
    }

    /// Marks a block as requested from `peer`. A block is outstanding on at
    /// most one peer at a time; the scheduler never hands out a block that
    /// is not Missing.
    pub fn mark_requested(&mut self, peer: SocketAddr, index: u32, offset: u32) {
        if let Some(block) = self.block_mut(index, offset) {
            debug_assert_eq!(block.state, BlockState::Missing);
            block.state = BlockState::Requested;
            block.requested_at = Some(Instant::now());
            block.requested_from = Some(peer);
        }
    }

    /// Reverts a single requested block to Missing (request timed out or
    /// was cancelled by a Choke).
    pub fn mark_timed_out(&mut self, index: u32, offset: u32) {
        if let Some(block) = self.block_mut(index, offset) {
            if block.state == BlockState::Requested {
                block.reset();
            }
        }
    }

    /// Sweeps all blocks whose request is older than `cutoff` back to
    /// Missing. Returns the released (peer, piece, offset) triples so the
    /// caller can drop them from the peers' inflight sets.
    pub fn release_expired(&mut self, cutoff: Instant) -> Vec<(SocketAddr, u32, u32)> {
        let mut released = Vec::new();
        for piece in &mut self.pieces {
            for block in &mut piece.blocks {
                if block.state == BlockState::Requested {
                    let expired = block.requested_at.map_or(true, |at| at < cutoff);
                    if expired {
                        if let Some(peer) = block.requested_from {
                            released.push((peer, piece.index, block.offset));
                        }
                        block.reset();
                    }
                }
            }
        }
        if !released.is_empty() {
            debug!(count = released.len(), "released timed out block requests");
        }
        released
    }

    /// Reverts every block requested from `peer` (the peer choked us,
    /// disconnected, or violated the protocol). Returns the released
    /// (piece, offset) pairs.
    pub fn release_peer(&mut self, peer: SocketAddr) -> Vec<(u32, u32)> {
        let mut released = Vec::new();
        for piece in &mut self.pieces {
            for block in &mut piece.blocks {
                if block.state == BlockState::Requested && block.requested_from == Some(peer) {
                    released.push((piece.index, block.offset));
                    block.reset();
                }
            }
        }
        released
    }

    fn block_mut(&mut self, index: u32, offset: u32) -> Option<&mut Block> {
        if offset % BLOCK_SIZE != 0 {
            return None;
        }
        self.pieces
            .get_mut(index as usize)?
            .blocks
            .get_mut((offset / BLOCK_SIZE) as usize)
    }

    pub fn add_uploaded(&mut self, bytes: u64) {
        self.uploaded += bytes;
    }

    /// Progress counters for the tracker report.
    pub fn completion(&self) -> (u64, u64, u64) {
        (self.downloaded, self.uploaded, self.left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BLOCK_SIZE;
    use crate::torrent::TorrentFile;

    fn peer() -> SocketAddr {
        "10.0.0.1:6881".parse().unwrap()
    }

    /// One-piece torrent whose payload is `data`, with a correct hash.
    fn store_for(data: &[u8], piece_length: i64) -> PieceStore {
        let len = data.len() as i64;
        let num_pieces = ((len + piece_length - 1) / piece_length) as usize;
        let mut pieces = Vec::new();
        for i in 0..num_pieces {
            let start = i * piece_length as usize;
            let end = (start + piece_length as usize).min(data.len());
            let digest: [u8; 20] = Sha1::digest(&data[start..end]).into();
            pieces.extend_from_slice(&digest);
        }

        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce20:http://t.example/ann4:infod6:length");
        raw.extend_from_slice(format!("i{}e", data.len()).as_bytes());
        raw.extend_from_slice(b"4:name8:test.bin12:piece length");
        raw.extend_from_slice(format!("i{}e", piece_length).as_bytes());
        raw.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        raw.extend_from_slice(&pieces);
        raw.extend_from_slice(b"ee");

        let torrent = TorrentFile::from_bytes(&raw).expect("test torrent parses");
        PieceStore::new(&torrent)
    }

    #[test]
    fn assembles_and_verifies_out_of_order() {
        // 20 000-byte last piece of a 32 768-piece torrent: blocks of
        // 16 384 + 3 616
        let data: Vec<u8> = (0..32_768 + 20_000).map(|i| (i % 251) as u8).collect();
        let mut store = store_for(&data, 32_768);
        assert_eq!(store.num_pieces(), 2);

        let last = &data[32_768..];
        store.mark_requested(peer(), 1, 0);
        store.mark_requested(peer(), 1, BLOCK_SIZE);

        // last block first
        assert_eq!(
            store.record_block(1, BLOCK_SIZE, &last[BLOCK_SIZE as usize..]),
            BlockOutcome::Accepted
        );
        assert_eq!(
            store.record_block(1, 0, &last[..BLOCK_SIZE as usize]),
            BlockOutcome::PieceVerified(1)
        );

        assert!(store.has_piece(1));
        assert_eq!(store.take_piece_data(1).unwrap(), last);
        // buffer can only be taken once
        assert!(store.take_piece_data(1).is_none());

        let (downloaded, _, left) = store.completion();
        assert_eq!(downloaded, 20_000);
        assert_eq!(left, 32_768);
    }

    #[test]
    fn hash_mismatch_resets_blocks() {
        let data: Vec<u8> = (0..20_000).map(|i| (i % 7) as u8).collect();
        let mut store = store_for(&data, 32_768);

        let mut corrupted = data.clone();
        corrupted[100] ^= 0xFF;

        store.mark_requested(peer(), 0, 0);
        store.mark_requested(peer(), 0, BLOCK_SIZE);
        assert_eq!(
            store.record_block(0, 0, &corrupted[..BLOCK_SIZE as usize]),
            BlockOutcome::Accepted
        );
        assert_eq!(
            store.record_block(0, BLOCK_SIZE, &corrupted[BLOCK_SIZE as usize..]),
            BlockOutcome::PieceFailed(0)
        );

        assert!(!store.has_piece(0));
        let piece = &store.pieces()[0];
        assert!(piece
            .blocks
            .iter()
            .all(|b| b.state == BlockState::Missing));
        assert_eq!(piece.failures, 1);

        // counters untouched by the failed attempt
        let (downloaded, _, left) = store.completion();
        assert_eq!(downloaded, 0);
        assert_eq!(left, 20_000);

        // a clean retry succeeds
        store.mark_requested(peer(), 0, 0);
        store.mark_requested(peer(), 0, BLOCK_SIZE);
        assert_eq!(
            store.record_block(0, 0, &data[..BLOCK_SIZE as usize]),
            BlockOutcome::Accepted
        );
        assert_eq!(
            store.record_block(0, BLOCK_SIZE, &data[BLOCK_SIZE as usize..]),
            BlockOutcome::PieceVerified(0)
        );
        assert!(store.is_complete());
    }

    #[test]
    fn rejects_unsolicited_and_mismatched_blocks() {
        let data = vec![0xABu8; 1000];
        let mut store = store_for(&data, 16_384);

        // not outstanding
        assert_eq!(store.record_block(0, 0, &data), BlockOutcome::Rejected);

        store.mark_requested(peer(), 0, 0);
        // wrong length
        assert_eq!(store.record_block(0, 0, &data[..999]), BlockOutcome::Rejected);
        // unknown offset
        assert_eq!(store.record_block(0, 512, &data), BlockOutcome::Rejected);
        // unknown piece
        assert_eq!(store.record_block(9, 0, &data), BlockOutcome::Rejected);

        // the declared block still goes through
        assert_eq!(store.record_block(0, 0, &data), BlockOutcome::PieceVerified(0));
        // duplicate delivery after verification
        assert_eq!(store.record_block(0, 0, &data), BlockOutcome::Rejected);
    }

    #[test]
    fn downloaded_plus_left_is_invariant() {
        let data: Vec<u8> = (0..40_000).map(|i| (i % 13) as u8).collect();
        let mut store = store_for(&data, 16_384);
        let total = store.total_length();

        for piece_idx in 0..store.num_pieces() as u32 {
            let p_start = piece_idx as usize * 16_384;
            let p_len = store.piece_length(piece_idx).unwrap() as usize;
            let piece_data = &data[p_start..p_start + p_len];
            let mut offset = 0u32;
            while (offset as usize) < p_len {
                let len = BLOCK_SIZE.min(p_len as u32 - offset) as usize;
                store.mark_requested(peer(), piece_idx, offset);
                store.record_block(
                    piece_idx,
                    offset,
                    &piece_data[offset as usize..offset as usize + len],
                );
                let (downloaded, _, left) = store.completion();
                assert_eq!(downloaded + left, total);
                offset += BLOCK_SIZE;
            }
        }
        assert!(store.is_complete());
        assert!(store.have_bitfield().any());
    }

    #[test]
    fn releases_expired_and_peer_requests() {
        let data = vec![1u8; 50_000];
        let mut store = store_for(&data, 16_384);

        let other: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        store.mark_requested(peer(), 0, 0);
        store.mark_requested(other, 1, 0);

        // cutoff in the future expires everything outstanding
        let cutoff = Instant::now() + std::time::Duration::from_secs(60);
        let released = store.release_expired(cutoff);
        assert_eq!(released.len(), 2);
        assert!(released.contains(&(peer(), 0, 0)));
        assert!(released.contains(&(other, 1, 0)));

        store.mark_requested(peer(), 0, 0);
        store.mark_requested(other, 1, 0);
        let released = store.release_peer(peer());
        assert_eq!(released, vec![(0, 0)]);
        // the other peer's request is untouched
        assert!(store.release_peer(other) == vec![(1, 0)]);
    }
}
