//! A small BitTorrent download engine: parse a .torrent descriptor,
//! announce to its tracker and pull the file from the swarm piece by
//! piece, verifying every piece against its SHA-1 digest.

pub mod bencode;
pub mod download;
pub mod error;
pub mod peer;
pub mod torrent;
pub mod tracker;

pub use download::Downloader;
pub use error::Error;
pub use torrent::Torrent;
