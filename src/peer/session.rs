use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::Error;
use crate::peer::Peer;
use crate::peer::handshake::{HANDSHAKE_LEN, Handshake};
use crate::peer::message::{Bitfield, Message, MessageId};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(45);
const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// One live connection to one peer.
///
/// Exists only in the handshaked state: `connect` either returns a usable
/// session or an error, never something half-built. Any I/O failure is
/// terminal; the session is dropped, not retried.
#[derive(Debug)]
pub struct PeerSession {
    stream: TcpStream,
    peer: Peer,
    pub choked: bool,
    pub availability: Bitfield,
}

impl PeerSession {
    /// Dials the peer, exchanges handshakes and verifies the infohash.
    /// Also picks up the bitfield most peers announce right after the
    /// handshake, so callers can gate work on availability immediately.
    pub async fn connect(
        peer: Peer,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        num_pieces: usize,
    ) -> Result<Self, Error> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(peer.socket_addr()))
            .await
            .map_err(|_| Error::HandshakeTimeout)?
            .map_err(|_| Error::ConnectionClosed)?;

        let mut session = PeerSession {
            stream,
            peer,
            choked: true,
            availability: Bitfield::from_piece_count(num_pieces),
        };
        session.handshake(info_hash, peer_id).await?;

        if let Ok(first) = timeout(FIRST_MESSAGE_TIMEOUT, session.read_message()).await {
            first?;
        }
        Ok(session)
    }

    async fn handshake(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<(), Error> {
        let ours = Handshake::new(info_hash, peer_id);
        self.stream
            .write_all(&ours.serialize())
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        timeout(HANDSHAKE_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| Error::HandshakeTimeout)?
            .map_err(|_| Error::MalformedHandshake)?;

        let theirs = Handshake::deserialize(&buf)?;
        if theirs.info_hash != info_hash {
            return Err(Error::HandshakeMismatch);
        }
        debug!(peer = %self.peer, "handshake complete");
        Ok(())
    }

    pub async fn send_interested(&mut self) -> Result<(), Error> {
        self.send(&Message::new(MessageId::Interested)).await
    }

    /// We never actually throttle anyone; announcing the unchoke is a
    /// protocol courtesy that encourages peers to reciprocate.
    pub async fn send_unchoke(&mut self) -> Result<(), Error> {
        self.send(&Message::new(MessageId::Unchoke)).await
    }

    pub async fn send_have(&mut self, index: usize) -> Result<(), Error> {
        self.send(&Message::have(index)).await
    }

    pub async fn send_request(
        &mut self,
        index: usize,
        begin: usize,
        length: usize,
    ) -> Result<(), Error> {
        self.send(&Message::request(index, begin, length)).await
    }

    async fn send(&mut self, msg: &Message) -> Result<(), Error> {
        self.stream
            .write_all(&msg.serialize())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Reads one message. Choke, unchoke, have and bitfield update the
    /// session before the message is handed back; keep-alives come out
    /// as `None`.
    pub async fn read_message(&mut self) -> Result<Option<Message>, Error> {
        let msg = timeout(READ_TIMEOUT, Message::read(&mut self.stream))
            .await
            .map_err(|_| Error::ReadTimeout)??;

        if let Some(msg) = &msg {
            match msg.id {
                MessageId::Choke => self.choked = true,
                MessageId::Unchoke => self.choked = false,
                MessageId::Have => self.availability.set_piece(msg.parse_have()?),
                MessageId::Bitfield => {
                    trace!(peer = %self.peer, "bitfield received");
                    self.availability.union(&msg.payload);
                }
                _ => {}
            }
        }
        Ok(msg)
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }
}
