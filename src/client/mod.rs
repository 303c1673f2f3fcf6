//! The session: one torrent, wired end to end.
//!
//! A `Session` owns everything the download needs and passes explicit
//! handles to its collaborators: the reactor gets the piece store and the
//! channels, the tracker task gets the stats watch and the peer-address
//! queue, the sink task gets the verified-piece queue. The only cross-task
//! boundaries are those channels.
use crate::piece::PieceStore;
use crate::reactor::Reactor;
use crate::storage::{self, FileLayout};
use crate::torrent::TorrentFile;
use crate::tracker::{self, Stats};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Peer addresses queued from the tracker task to the reactor.
const ADDR_CHANNEL_CAPACITY: usize = 64;
/// Verified pieces queued from the reactor to the file sink. Bounded so a
/// slow disk applies backpressure instead of growing memory.
const VERIFIED_CHANNEL_CAPACITY: usize = 64;

pub struct Session {
    torrent: Arc<TorrentFile>,
    port: u16,
    output_dir: PathBuf,
}

impl Session {
    pub fn new(torrent: TorrentFile, port: u16, output_dir: PathBuf) -> Self {
        Self {
            torrent: Arc::new(torrent),
            port,
            output_dir,
        }
    }

    /// Runs the download to completion (or until Ctrl-C). Returns whether
    /// every piece was downloaded and verified.
    pub async fn run(self) -> anyhow::Result<bool> {
        let layout = Arc::new(FileLayout::new(&self.torrent, &self.output_dir));
        layout
            .allocate()
            .await
            .context("allocating output files")?;
        let store = PieceStore::new(&self.torrent);

        let tracker = tracker::Client::new(self.port);
        let peer_id = tracker.peer_id();

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .context("binding the peer listen port")?;
        info!(
            name = %self.torrent.info.name,
            size = self.torrent.total_length(),
            pieces = self.torrent.num_pieces(),
            port = self.port,
            "session starting"
        );

        let shutdown = CancellationToken::new();
        let (addr_tx, addr_rx) = mpsc::channel(ADDR_CHANNEL_CAPACITY);
        let (verified_tx, verified_rx) = mpsc::channel(VERIFIED_CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = watch::channel(Stats {
            left: self.torrent.total_length() as u64,
            ..Stats::default()
        });

        let sink = tokio::spawn(storage::run_sink(layout.clone(), verified_rx));
        let announcer = tokio::spawn(tracker::run_announcer(
            tracker,
            self.torrent.clone(),
            addr_tx,
            stats_rx,
            shutdown.clone(),
        ));

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                signal_token.cancel();
            }
        });

        let reactor = Reactor::new(
            store,
            layout,
            self.torrent.info_hash,
            peer_id,
            addr_rx,
            verified_tx,
            stats_tx,
            listener,
            shutdown.clone(),
        );

        // The reactor owns the only verified-piece sender, so its return
        // closes the channel and the sink drains to completion below.
        let complete = reactor.run().await;

        shutdown.cancel();
        sink.await
            .context("file sink task panicked")?
            .context("writing verified pieces")?;

        // Give the announcer a moment for its goodbye, then move on.
        if tokio::time::timeout(Duration::from_secs(10), announcer)
            .await
            .is_err()
        {
            warn!("tracker goodbye timed out");
        }

        Ok(complete)
    }
}
