use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bitfetch::download::Downloader;
use bitfetch::error::Error;
use bitfetch::torrent::Torrent;
use bitfetch::tracker;

/// Download the file described by a .torrent descriptor.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The .torrent file describing the download.
    #[arg(short, long)]
    file: PathBuf,

    /// Where to write the downloaded file. Defaults to the name the
    /// descriptor advertises, in the current directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Port reported to the tracker.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let torrent = Torrent::from_file(&args.file)?;
    info!(
        name = %torrent.name,
        pieces = torrent.num_pieces(),
        bytes = torrent.length,
        "descriptor loaded"
    );

    let peer_id = tracker::generate_peer_id();
    let (_, peers) = tracker::announce(&torrent, &peer_id, args.port).await?;
    info!(count = peers.len(), "peers received from tracker");

    let output = args.output.unwrap_or_else(|| PathBuf::from(&torrent.name));
    let buf = Downloader::new(torrent, peers, peer_id).run().await?;
    tokio::fs::write(&output, &buf).await?;
    info!(path = %output.display(), "download complete");
    Ok(())
}
