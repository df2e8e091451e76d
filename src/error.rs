use thiserror::Error;

/// Everything that can go wrong between a `.torrent` descriptor and a
/// fully verified buffer.
///
/// Session and piece level failures are handled inside the download engine
/// (requeue and move on); only errors that make the whole download
/// impossible reach the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for peer handshake")]
    HandshakeTimeout,

    #[error("peer answered the handshake with a different infohash")]
    HandshakeMismatch,

    #[error("malformed handshake")]
    MalformedHandshake,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("timed out waiting for a message")]
    ReadTimeout,

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("message payload does not match its declared length")]
    TruncatedPayload,

    #[error("piece message for index {got}, expected {expected}")]
    PieceIndexMismatch { expected: usize, got: usize },

    #[error("piece transfer stalled")]
    StalledTransfer,

    #[error("piece {0} failed integrity check")]
    IntegrityFailure(usize),

    #[error("gave up on piece {0}: retry budget exhausted")]
    PieceAttemptsExhausted(usize),

    #[error("all peers disconnected before the download finished")]
    OutOfPeers,

    #[error("tracker peer list is not a multiple of 6 bytes")]
    MalformedPeerList,

    #[error("tracker rejected the announce: {0}")]
    Tracker(String),

    #[error("invalid announce url: {0}")]
    Url(#[from] url::ParseError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(String),

    #[error("invalid torrent descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
