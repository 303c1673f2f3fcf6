//! Binary entry point for pincer.
use anyhow::Context;
use clap::Parser;
use pincer::client::Session;
use pincer::torrent::TorrentFile;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pincer", version, about = "A BitTorrent leecher/seeder client")]
struct Cli {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// TCP port to listen on for peers; also reported to the tracker
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Directory the downloaded files are written into
    #[arg(long, default_value = ".")]
    output: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let raw = std::fs::read(&cli.torrent)
        .with_context(|| format!("reading {}", cli.torrent.display()))?;
    let torrent = TorrentFile::from_bytes(&raw)
        .with_context(|| format!("parsing {}", cli.torrent.display()))?;
    tracing::info!(
        name = %torrent.info.name,
        info_hash = %hex::encode(torrent.info_hash),
        "loaded torrent"
    );

    let complete = Session::new(torrent, cli.port, cli.output).run().await?;
    if complete {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
