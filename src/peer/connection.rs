//! Per-peer connection state.
//!
//! One `PeerConn` exists for every remote peer that completed the
//! handshake. It owns the write half of the socket (the read half is
//! driven by a separate framed reader task) and the protocol flags the
//! reactor consults when dispatching messages: the two choke/interest
//! pairs, the advertised bitfield, the set of requests in flight to the
//! peer, queued requests from the peer, and the idle clocks that drive
//! keep-alives.
use super::message::{Message, MessageCodec};
use super::PeerResult;
use crate::piece::{Bitfield, BlockRequest};
use futures_util::SinkExt;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::codec::FramedWrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

pub struct PeerConn {
    pub addr: SocketAddr,
    pub direction: Direction,
    pub remote_id: [u8; 20],

    // Choke and interest state, from our point of view. Initial values per
    // the protocol: both sides choked, neither interested.
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// Pieces the peer advertises, built from its Bitfield and Have
    /// messages.
    pub bitfield: Bitfield,
    /// Blocks currently requested from this peer, as (piece, offset).
    pub inflight: HashSet<(u32, u32)>,
    /// Requests the peer sent us that we have not served yet.
    pub upload_queue: VecDeque<BlockRequest>,
    /// True once any post-handshake message arrived. A Bitfield is only
    /// honored as the first message; later ones are ignored.
    pub saw_first_message: bool,
    /// Integrity strikes: pieces this peer completed that failed their
    /// hash check.
    pub strikes: u32,

    pub last_sent: Instant,
    pub last_received: Instant,

    writer: FramedWrite<OwnedWriteHalf, MessageCodec>,
}

impl PeerConn {
    pub fn new(
        addr: SocketAddr,
        direction: Direction,
        remote_id: [u8; 20],
        write_half: OwnedWriteHalf,
        num_pieces: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            addr,
            direction,
            remote_id,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(num_pieces),
            inflight: HashSet::new(),
            upload_queue: VecDeque::new(),
            saw_first_message: false,
            strikes: 0,
            last_sent: now,
            last_received: now,
            writer: FramedWrite::new(write_half, MessageCodec),
        }
    }

    /// Serializes and writes one message, refreshing the outbound idle
    /// clock the keep-alive timer runs on.
    pub async fn send(&mut self, message: Message) -> PeerResult<()> {
        self.writer.send(message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// A peer is usable for downloading once it has unchoked us.
    pub fn can_request(&self) -> bool {
        !self.peer_choking
    }

    pub fn note_received(&mut self) {
        self.last_received = Instant::now();
    }
}

impl std::fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConn")
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .field("am_choking", &self.am_choking)
            .field("am_interested", &self.am_interested)
            .field("peer_choking", &self.peer_choking)
            .field("peer_interested", &self.peer_interested)
            .field("inflight", &self.inflight.len())
            .field("strikes", &self.strikes)
            .finish()
    }
}
