//! The reactor: one task that owns the piece store, the peer table, and
//! every peer connection.
//!
//! All protocol state is mutated here and only here. Per-peer framed
//! reader tasks do nothing but decode frames and forward them over the
//! event channel, so a single peer's messages are processed strictly in
//! arrival order and no lock sits around the piece store. Outbound frames
//! are written through each peer's write half, also from this task, which
//! makes the ordering guarantee for Have broadcasts trivial: the broadcast
//! is written before any later Request is even generated.
use crate::peer::connection::{Direction, PeerConn};
use crate::peer::handshake;
use crate::peer::message::{Message, MessageCodec};
use crate::peer::{PeerError, PeerResult};
use crate::piece::{Bitfield, PieceStore, BLOCK_SIZE};
use crate::storage::{FileLayout, VerifiedPiece};
use crate::tracker::Stats;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Readiness poll cadence for timeout and keep-alive sweeps.
const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// A block requested longer ago than this reverts to Missing.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Send an empty frame after this much outbound idle.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
/// Outbound connect retry budget.
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);
/// Corrupt pieces tolerated from one peer before disconnecting it.
const MAX_STRIKES: u32 = 3;
/// Largest block a remote may request from us.
const MAX_SERVED_BLOCK: u32 = 2 * BLOCK_SIZE;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the reactor reacts to, funneled through one channel so the
/// loop stays a flat `select!`.
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        addr: SocketAddr,
        direction: Direction,
        stream: TcpStream,
        remote_id: [u8; 20],
    },
    Message {
        addr: SocketAddr,
        message: Message,
    },
    Disconnected {
        addr: SocketAddr,
        reason: String,
    },
    ConnectFailed {
        addr: SocketAddr,
    },
}

pub struct Reactor {
    store: PieceStore,
    layout: Arc<FileLayout>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],

    peers: HashMap<SocketAddr, PeerConn>,
    /// Outbound dials in progress, so one tracker response does not open
    /// the same connection twice.
    connecting: HashSet<SocketAddr>,

    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    addr_rx: mpsc::Receiver<SocketAddr>,
    verified_tx: mpsc::Sender<VerifiedPiece>,
    stats_tx: watch::Sender<Stats>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: PieceStore,
        layout: Arc<FileLayout>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        addr_rx: mpsc::Receiver<SocketAddr>,
        verified_tx: mpsc::Sender<VerifiedPiece>,
        stats_tx: watch::Sender<Stats>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            layout,
            info_hash,
            peer_id,
            peers: HashMap::new(),
            connecting: HashSet::new(),
            events_tx,
            events_rx,
            addr_rx,
            verified_tx,
            stats_tx,
            listener,
            shutdown,
        }
    }

    /// Drives the swarm until the download is verified-complete or
    /// shutdown is requested.
    #[instrument(skip(self), fields(info_hash = %hex::encode(self.info_hash)))]
    pub async fn run(mut self) -> bool {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.publish_stats();

        loop {
            if self.store.is_complete() {
                info!("download complete");
                return true;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    return self.store.is_complete();
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
                Some(addr) = self.addr_rx.recv() => {
                    self.connect_to(addr);
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept_inbound(stream, addr),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected {
                addr,
                direction,
                stream,
                remote_id,
            } => {
                self.connecting.remove(&addr);
                self.register_peer(addr, direction, stream, remote_id).await;
            }
            PeerEvent::ConnectFailed { addr } => {
                self.connecting.remove(&addr);
            }
            PeerEvent::Message { addr, message } => {
                if let Some(conn) = self.peers.get_mut(&addr) {
                    conn.note_received();
                } else {
                    return;
                }
                if let Err(e) = self.handle_message(addr, message).await {
                    self.drop_peer(addr, &e.to_string());
                }
            }
            PeerEvent::Disconnected { addr, reason } => {
                self.drop_peer(addr, &reason);
            }
        }
    }

    /// Installs a freshly handshaken peer: spawn its reader, send our
    /// bitfield (always, even when we have nothing yet), and declare
    /// interest if the peer might be useful.
    async fn register_peer(
        &mut self,
        addr: SocketAddr,
        direction: Direction,
        stream: TcpStream,
        remote_id: [u8; 20],
    ) {
        if self.peers.contains_key(&addr) {
            debug!(%addr, "already connected, dropping duplicate");
            return;
        }

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(read_loop(read_half, addr, self.events_tx.clone()));

        let mut conn = PeerConn::new(
            addr,
            direction,
            remote_id,
            write_half,
            self.store.num_pieces(),
        );
        info!(%addr, ?direction, "peer connected");

        let bitfield = self.store.have_bitfield();
        let sent = conn.send(Message::Bitfield(bitfield.as_bytes().to_vec())).await;
        self.peers.insert(addr, conn);
        match sent {
            Ok(()) => {
                if let Err(e) = self.update_interest(addr).await {
                    self.drop_peer(addr, &e.to_string());
                }
            }
            Err(e) => self.drop_peer(addr, &e.to_string()),
        }
    }

    /// Applies one decoded message to the peer's state machine.
    async fn handle_message(&mut self, addr: SocketAddr, message: Message) -> PeerResult<()> {
        let Some(conn) = self.peers.get_mut(&addr) else {
            return Ok(());
        };
        let first_message = !conn.saw_first_message;
        conn.saw_first_message = true;

        match message {
            Message::KeepAlive => {}

            Message::Choke => {
                conn.peer_choking = true;
                let cancelled: Vec<(u32, u32)> = conn.inflight.drain().collect();
                for (piece, offset) in cancelled {
                    self.store.mark_timed_out(piece, offset);
                }
            }

            Message::Unchoke => {
                conn.peer_choking = false;
                self.pump_requests(addr).await?;
            }

            Message::Interested => {
                conn.peer_interested = true;
                // No choking algorithm: anyone interested gets unchoked.
                if conn.am_choking {
                    conn.am_choking = false;
                    conn.send(Message::Unchoke).await?;
                }
            }

            Message::NotInterested => {
                conn.peer_interested = false;
            }

            Message::Have(index) => {
                conn.bitfield.set(index);
                self.update_interest(addr).await?;
                self.pump_requests(addr).await?;
            }

            Message::Bitfield(bytes) => {
                if !first_message {
                    debug!(%addr, "ignoring late bitfield");
                    return Ok(());
                }
                let field = Bitfield::from_bytes(&bytes, self.store.num_pieces())
                    .ok_or(PeerError::MalformedPayload("bitfield"))?;
                conn.bitfield = field;
                self.update_interest(addr).await?;
            }

            Message::Request(request) => {
                if request.length == 0 || request.length > MAX_SERVED_BLOCK {
                    return Err(PeerError::MalformedPayload("request"));
                }
                if conn.am_choking {
                    // peer ignored our choke state; drop the request, not
                    // the peer
                    return Ok(());
                }
                conn.upload_queue.push_back(request);
                self.serve_uploads(addr).await?;
            }

            Message::Piece { index, begin, data } => {
                conn.inflight.remove(&(index, begin));
                self.apply_block(addr, index, begin, data).await?;
            }

            Message::Cancel(request) => {
                conn.upload_queue.retain(|queued| queued != &request);
            }

            Message::Port(port) => {
                // DHT is not supported; accepted and ignored.
                debug!(%addr, port, "ignoring DHT port message");
            }
        }
        Ok(())
    }

    /// Feeds a received block into the store and reacts to the outcome.
    async fn apply_block(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> PeerResult<()> {
        use crate::piece::BlockOutcome;

        match self.store.record_block(index, begin, &data) {
            BlockOutcome::Accepted => {
                self.pump_requests(addr).await?;
            }
            BlockOutcome::Rejected => {
                debug!(%addr, piece = index, offset = begin, "rejected block");
            }
            BlockOutcome::PieceVerified(piece) => {
                if let Some(data) = self.store.take_piece_data(piece) {
                    // Bounded channel: backpressure from the sink parks
                    // the reactor rather than growing memory.
                    if self.verified_tx.send(VerifiedPiece { index: piece, data }).await.is_err() {
                        warn!("file sink is gone, discarding verified piece");
                    }
                }
                self.publish_stats();
                self.broadcast_have(piece).await;
                self.update_interest(addr).await?;
                self.pump_requests(addr).await?;
            }
            BlockOutcome::PieceFailed(piece) => {
                // Blame the peer that delivered the deciding block.
                if let Some(conn) = self.peers.get_mut(&addr) {
                    conn.strikes += 1;
                    warn!(%addr, piece, strikes = conn.strikes, "piece failed verification");
                    if conn.strikes >= MAX_STRIKES {
                        self.drop_peer(addr, "too many corrupt pieces");
                        return Ok(());
                    }
                }
                self.pump_requests(addr).await?;
            }
        }
        Ok(())
    }

    /// Tops the peer's pipeline up to the inflight cap.
    async fn pump_requests(&mut self, addr: SocketAddr) -> PeerResult<()> {
        loop {
            let Some(conn) = self.peers.get_mut(&addr) else {
                return Ok(());
            };
            if !conn.can_request() {
                return Ok(());
            }
            let Some(request) = self.store.next_request(&conn.bitfield, conn.inflight.len())
            else {
                return Ok(());
            };
            conn.send(Message::Request(request)).await?;
            conn.inflight.insert((request.index, request.begin));
            self.store.mark_requested(addr, request.index, request.begin);
        }
    }

    /// Serves queued remote requests from disk, oldest first.
    async fn serve_uploads(&mut self, addr: SocketAddr) -> PeerResult<()> {
        loop {
            let Some(conn) = self.peers.get_mut(&addr) else {
                return Ok(());
            };
            let Some(request) = conn.upload_queue.pop_front() else {
                return Ok(());
            };
            if !self.store.has_piece(request.index) {
                debug!(%addr, piece = request.index, "requested piece we do not have");
                continue;
            }

            let layout = self.layout.clone();
            let block = match layout
                .read_block(request.index, request.begin, request.length)
                .await
            {
                Ok(block) => block,
                Err(e) => {
                    warn!(%addr, error = %e, "failed to read block for upload");
                    continue;
                }
            };

            let Some(conn) = self.peers.get_mut(&addr) else {
                return Ok(());
            };
            conn.send(Message::Piece {
                index: request.index,
                begin: request.begin,
                data: block,
            })
            .await?;
            self.store.add_uploaded(request.length as u64);
            self.publish_stats();
        }
    }

    /// Declares or withdraws interest based on what the peer advertises.
    async fn update_interest(&mut self, addr: SocketAddr) -> PeerResult<()> {
        let Some(conn) = self.peers.get_mut(&addr) else {
            return Ok(());
        };
        let wants = self.store.wants_from(&conn.bitfield);
        if wants && !conn.am_interested {
            conn.am_interested = true;
            conn.send(Message::Interested).await?;
        } else if !wants && conn.am_interested {
            conn.am_interested = false;
            conn.send(Message::NotInterested).await?;
        }
        Ok(())
    }

    /// Tells every connected peer we now have `piece`.
    async fn broadcast_have(&mut self, piece: u32) {
        let mut failed = Vec::new();
        for (addr, conn) in self.peers.iter_mut() {
            if conn.send(Message::Have(piece)).await.is_err() {
                failed.push(*addr);
            }
        }
        for addr in failed {
            self.drop_peer(addr, "write failed during have broadcast");
        }
    }

    /// Timeout and keep-alive sweep.
    async fn on_tick(&mut self) {
        if let Some(cutoff) = Instant::now().checked_sub(BLOCK_TIMEOUT) {
            for (peer, piece, offset) in self.store.release_expired(cutoff) {
                debug!(%peer, piece, offset, "block request timed out");
                if let Some(conn) = self.peers.get_mut(&peer) {
                    conn.inflight.remove(&(piece, offset));
                }
            }
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            if let Err(e) = self.pump_requests(addr).await {
                self.drop_peer(addr, &e.to_string());
            }
        }

        let idle: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, conn)| conn.last_sent.elapsed() >= KEEPALIVE_INTERVAL)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in idle {
            let Some(conn) = self.peers.get_mut(&addr) else {
                continue;
            };
            if conn.send(Message::KeepAlive).await.is_err() {
                self.drop_peer(addr, "write failed during keep-alive");
            }
        }
    }

    /// Dials a tracker-discovered peer with the connect retry budget. A
    /// failed handshake is a protocol violation and is not retried.
    fn connect_to(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr) || !self.connecting.insert(addr) {
            return;
        }
        let events_tx = self.events_tx.clone();
        let info_hash = self.info_hash;
        let peer_id = self.peer_id;

        tokio::spawn(async move {
            for attempt in 1..=CONNECT_ATTEMPTS {
                match TcpStream::connect(addr).await {
                    Ok(mut stream) => {
                        match handshake::exchange(&mut stream, info_hash, peer_id, false).await {
                            Ok(theirs) => {
                                let event = PeerEvent::Connected {
                                    addr,
                                    direction: Direction::Outbound,
                                    stream,
                                    remote_id: theirs.peer_id,
                                };
                                events_tx.send(event).await.ok();
                                return;
                            }
                            Err(e) => {
                                debug!(%addr, error = %e, "handshake failed");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(%addr, attempt, error = %e, "connect failed");
                        if attempt < CONNECT_ATTEMPTS {
                            tokio::time::sleep(CONNECT_BACKOFF).await;
                        }
                    }
                }
            }
            events_tx.send(PeerEvent::ConnectFailed { addr }).await.ok();
        });
    }

    /// Handles an inbound connection: the remote speaks first.
    fn accept_inbound(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let events_tx = self.events_tx.clone();
        let info_hash = self.info_hash;
        let peer_id = self.peer_id;

        tokio::spawn(async move {
            match handshake::exchange(&mut stream, info_hash, peer_id, true).await {
                Ok(theirs) => {
                    let event = PeerEvent::Connected {
                        addr,
                        direction: Direction::Inbound,
                        stream,
                        remote_id: theirs.peer_id,
                    };
                    events_tx.send(event).await.ok();
                }
                Err(e) => {
                    debug!(%addr, error = %e, "inbound handshake failed");
                }
            }
        });
    }

    fn drop_peer(&mut self, addr: SocketAddr, reason: &str) {
        if self.peers.remove(&addr).is_some() {
            warn!(%addr, reason, "dropping peer");
        }
        self.store.release_peer(addr);
    }

    fn publish_stats(&self) {
        let (downloaded, uploaded, left) = self.store.completion();
        self.stats_tx.send_replace(Stats {
            downloaded,
            uploaded,
            left,
        });
    }
}

/// Framed reader for one peer. Forwards every decoded message to the
/// reactor in arrival order and reports the reason the stream ended.
async fn read_loop(
    read_half: OwnedReadHalf,
    addr: SocketAddr,
    events_tx: mpsc::Sender<PeerEvent>,
) {
    let mut frames = FramedRead::new(read_half, MessageCodec);
    loop {
        match frames.next().await {
            Some(Ok(message)) => {
                if events_tx
                    .send(PeerEvent::Message { addr, message })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(e)) => {
                events_tx
                    .send(PeerEvent::Disconnected {
                        addr,
                        reason: e.to_string(),
                    })
                    .await
                    .ok();
                return;
            }
            None => {
                events_tx
                    .send(PeerEvent::Disconnected {
                        addr,
                        reason: "connection closed".to_string(),
                    })
                    .await
                    .ok();
                return;
            }
        }
    }
}
