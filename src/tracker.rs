use std::net::Ipv4Addr;
use std::time::Duration;

use once_cell::sync::Lazy;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use rand::RngCore;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::bencode::{self, Value};
use crate::error::Error;
use crate::peer::Peer;
use crate::torrent::Torrent;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);
const PEER_ID_PREFIX: &[u8] = b"-BF0001-";

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent("bitfetch/0.1")
        .timeout(ANNOUNCE_TIMEOUT)
        .build()
        .expect("failed to build HTTP client")
});

/// A fresh 20-byte peer identifier carrying the client prefix.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    rand::rng().fill_bytes(&mut id[PEER_ID_PREFIX.len()..]);
    id
}

fn build_announce_url(torrent: &Torrent, peer_id: &[u8; 20], port: u16) -> Result<String, Error> {
    let mut base = Url::parse(&torrent.announce)?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
        percent_encode(&torrent.info_hash, NON_ALPHANUMERIC),
        percent_encode(peer_id, NON_ALPHANUMERIC),
        port,
        torrent.length
    );
    base.set_query(Some(&query));
    Ok(base.to_string())
}

/// Decodes the tracker's compact peer blob: 6 bytes per peer, a 4-byte
/// IPv4 address followed by a big-endian port.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<Peer>, Error> {
    if bytes.len() % 6 != 0 {
        return Err(Error::MalformedPeerList);
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| Peer {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

/// Announces to the tracker and returns the re-announce interval in
/// seconds plus the candidate peers.
pub async fn announce(
    torrent: &Torrent,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<(u64, Vec<Peer>), Error> {
    let url = build_announce_url(torrent, peer_id, port)?;
    let response = HTTP_CLIENT.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Tracker(format!("status {}", response.status())));
    }
    let body = response.bytes().await?;

    let root = bencode::parse(&body)?;
    if let Some(reason) = root.get(b"failure reason").and_then(Value::as_bytes) {
        return Err(Error::Tracker(String::from_utf8_lossy(reason).into_owned()));
    }

    let interval = root
        .get(b"interval")
        .and_then(Value::as_integer)
        .unwrap_or(0)
        .max(0) as u64;
    let peers = root
        .get(b"peers")
        .and_then(Value::as_bytes)
        .ok_or_else(|| Error::Tracker("no peers in response".to_string()))?;
    let peers = parse_compact_peers(peers)?;

    debug!(count = peers.len(), interval, "tracker announce complete");
    Ok((interval, peers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn test_torrent() -> Torrent {
        Torrent {
            announce: "http://tracker.example.com:8080/announce".to_string(),
            info_hash: [
                1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
            ],
            piece_hashes: vec![[0u8; 20]; 64],
            piece_length: 16384,
            length: 1048576,
            name: "test.bin".to_string(),
        }
    }

    #[test]
    fn announce_url_carries_required_params() {
        let torrent = test_torrent();
        let peer_id = *b"-BF0001-qrstuvwxyz01";
        let url = build_announce_url(&torrent, &peer_id, 6881).unwrap();

        assert!(url.starts_with("http://tracker.example.com:8080/announce?"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=0"));
        assert!(url.contains("downloaded=0"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("left=1048576"));
        assert!(url.contains("info_hash=%01%02%03"));
        assert!(url.contains("peer_id="));
    }

    #[test]
    fn announce_url_rejects_bad_announce() {
        let mut torrent = test_torrent();
        torrent.announce = "not a url".to_string();
        assert!(build_announce_url(&torrent, &[0u8; 20], 6881).is_err());
    }

    #[test]
    fn compact_list_of_twelve_bytes_is_two_peers() {
        let blob = [
            192, 168, 1, 1, 0x1A, 0xE1, // 192.168.1.1:6881
            10, 0, 0, 1, 0x1F, 0x90, // 10.0.0.1:8080
        ];
        let peers = parse_compact_peers(&blob).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(peers[1].port, 8080);
    }

    #[test]
    fn compact_list_of_thirteen_bytes_is_malformed() {
        let blob = [0u8; 13];
        assert_matches!(parse_compact_peers(&blob), Err(Error::MalformedPeerList));
    }

    #[test]
    fn empty_compact_list_is_no_peers() {
        assert_eq!(parse_compact_peers(&[]).unwrap().len(), 0);
    }

    #[test]
    fn compact_port_is_big_endian() {
        let blob = [127, 0, 0, 1, 0x01, 0x00];
        let peers = parse_compact_peers(&blob).unwrap();
        assert_eq!(peers[0].port, 256);
    }

    #[test]
    fn generated_peer_id_has_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..PEER_ID_PREFIX.len()], PEER_ID_PREFIX);
        assert_eq!(id.len(), 20);
    }
}
