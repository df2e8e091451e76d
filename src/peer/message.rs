use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            other => Err(Error::UnknownMessageId(other)),
        }
    }
}

/// A single length-prefixed protocol message.
///
/// Keep-alives have no representation here; the decoders hand them back
/// as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// The wire form of a keep-alive: a zero length prefix and nothing else.
pub const KEEP_ALIVE: [u8; 4] = [0u8; 4];

impl Message {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            payload: Vec::new(),
        }
    }

    pub fn have(index: usize) -> Self {
        Self {
            id: MessageId::Have,
            payload: (index as u32).to_be_bytes().to_vec(),
        }
    }

    pub fn request(index: usize, begin: usize, length: usize) -> Self {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&(index as u32).to_be_bytes());
        payload.extend_from_slice(&(begin as u32).to_be_bytes());
        payload.extend_from_slice(&(length as u32).to_be_bytes());
        Self {
            id: MessageId::Request,
            payload,
        }
    }

    /// Same payload layout as `request`.
    pub fn cancel(index: usize, begin: usize, length: usize) -> Self {
        Self {
            id: MessageId::Cancel,
            ..Self::request(index, begin, length)
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let total_len = 1 + self.payload.len(); // 1 byte for the ID
        let mut buf = Vec::with_capacity(4 + total_len);
        buf.extend_from_slice(&(total_len as u32).to_be_bytes());
        buf.push(self.id as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes one message from a buffer. A zero length prefix is a
    /// keep-alive and comes back as `Ok(None)`.
    pub fn deserialize(buf: &[u8]) -> Result<Option<Self>, Error> {
        if buf.len() < 4 {
            return Err(Error::TruncatedPayload);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len == 0 {
            return Ok(None);
        }
        if buf.len() < 4 + len {
            return Err(Error::TruncatedPayload);
        }

        let id = MessageId::try_from(buf[4])?;
        Ok(Some(Self {
            id,
            payload: buf[5..4 + len].to_vec(),
        }))
    }

    /// Reads one full message off the stream.
    pub async fn read<R>(stream: &mut R) -> Result<Option<Self>, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(None); // keep-alive
        }

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::TruncatedPayload
            } else {
                Error::ConnectionClosed
            }
        })?;

        let id = MessageId::try_from(body[0])?;
        Ok(Some(Self {
            id,
            payload: body[1..].to_vec(),
        }))
    }

    /// Extracts the piece index of a `have` message.
    pub fn parse_have(&self) -> Result<usize, Error> {
        if self.id != MessageId::Have || self.payload.len() != 4 {
            return Err(Error::TruncatedPayload);
        }
        let index = u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Ok(index as usize)
    }

    /// Copies the block carried by a `piece` message into `buf` at its
    /// `begin` offset and returns the number of bytes written. Fails if
    /// the message cites a different piece than the one being assembled.
    pub fn parse_piece(&self, index: usize, buf: &mut [u8]) -> Result<usize, Error> {
        if self.id != MessageId::Piece || self.payload.len() < 8 {
            return Err(Error::TruncatedPayload);
        }
        let got = u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]) as usize;
        if got != index {
            return Err(Error::PieceIndexMismatch {
                expected: index,
                got,
            });
        }
        let begin = u32::from_be_bytes([
            self.payload[4],
            self.payload[5],
            self.payload[6],
            self.payload[7],
        ]) as usize;
        let block = &self.payload[8..];
        if begin + block.len() > buf.len() {
            return Err(Error::TruncatedPayload);
        }
        buf[begin..begin + block.len()].copy_from_slice(block);
        Ok(block.len())
    }
}

/// Which pieces a peer has confirmed to hold: one bit per piece index,
/// MSB first within each byte. Fixed size, set-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
}

impl Bitfield {
    pub fn from_piece_count(count: usize) -> Self {
        Self {
            bits: vec![0; count.div_ceil(8)],
        }
    }

    pub fn from_bytes(bits: Vec<u8>) -> Self {
        Self { bits }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = 7 - (index % 8);
        if byte >= self.bits.len() {
            return false;
        }
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn set_piece(&mut self, index: usize) {
        let byte = index / 8;
        let bit = 7 - (index % 8);
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << bit;
        }
    }

    /// ORs a raw wire bitfield into this map. Bytes past the fixed size
    /// are dropped, so a peer cannot grow the map.
    pub fn union(&mut self, raw: &[u8]) {
        for (dst, src) in self.bits.iter_mut().zip(raw) {
            *dst |= src;
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn serialize_without_payload() {
        let buf = Message::new(MessageId::Choke).serialize();
        assert_eq!(buf, vec![0, 0, 0, 1, 0]);
    }

    #[test]
    fn serialize_request_layout() {
        let buf = Message::request(1, 16384, 16384).serialize();
        assert_eq!(buf[0..4], [0, 0, 0, 13]); // 1 id + 12 payload
        assert_eq!(buf[4], 6);
        assert_eq!(buf[5..9], 1u32.to_be_bytes());
        assert_eq!(buf[9..13], 16384u32.to_be_bytes());
        assert_eq!(buf[13..17], 16384u32.to_be_bytes());
    }

    #[test]
    fn cancel_mirrors_request_layout() {
        let request = Message::request(3, 0, 512);
        let cancel = Message::cancel(3, 0, 512);
        assert_eq!(cancel.id, MessageId::Cancel);
        assert_eq!(cancel.payload, request.payload);
    }

    #[test]
    fn roundtrip() {
        let original = Message {
            id: MessageId::Piece,
            payload: vec![1, 2, 3, 4, 5],
        };
        let decoded = Message::deserialize(&original.serialize()).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn keep_alive_decodes_to_none() {
        assert_matches!(Message::deserialize(&KEEP_ALIVE), Ok(None));
    }

    #[test]
    fn unknown_id_is_rejected() {
        let buf = vec![0, 0, 0, 1, 99];
        assert_matches!(Message::deserialize(&buf), Err(Error::UnknownMessageId(99)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let buf = vec![0, 0, 0, 5, 4, 0x12]; // declares 5, delivers 2
        assert_matches!(Message::deserialize(&buf), Err(Error::TruncatedPayload));
    }

    #[test]
    fn parse_have_extracts_index() {
        let index = Message::have(42).parse_have().unwrap();
        assert_eq!(index, 42);
    }

    #[test]
    fn parse_have_rejects_short_payload() {
        let msg = Message {
            id: MessageId::Have,
            payload: vec![0, 0],
        };
        assert_matches!(msg.parse_have(), Err(Error::TruncatedPayload));
    }

    #[test]
    fn parse_piece_copies_block_at_offset() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&4u32.to_be_bytes());
        payload.extend_from_slice(&[0xAA, 0xBB]);
        let msg = Message {
            id: MessageId::Piece,
            payload,
        };

        let mut buf = [0u8; 8];
        let n = msg.parse_piece(0, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, [0, 0, 0, 0, 0xAA, 0xBB, 0, 0]);
    }

    #[test]
    fn parse_piece_rejects_wrong_index() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.push(0xFF);
        let msg = Message {
            id: MessageId::Piece,
            payload,
        };

        let mut buf = [0u8; 4];
        assert_matches!(
            msg.parse_piece(2, &mut buf),
            Err(Error::PieceIndexMismatch {
                expected: 2,
                got: 3
            })
        );
        assert_eq!(buf, [0u8; 4]); // buffer untouched
    }

    #[test]
    fn parse_piece_rejects_block_past_buffer_end() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&[1, 2, 3]);
        let msg = Message {
            id: MessageId::Piece,
            payload,
        };

        let mut buf = [0u8; 4];
        assert_matches!(msg.parse_piece(0, &mut buf), Err(Error::TruncatedPayload));
    }

    #[tokio::test]
    async fn read_decodes_framed_stream() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&KEEP_ALIVE);
        wire.extend_from_slice(&Message::have(9).serialize());
        let mut cursor = std::io::Cursor::new(wire);

        let first = Message::read(&mut cursor).await.unwrap();
        assert!(first.is_none());
        let second = Message::read(&mut cursor).await.unwrap().unwrap();
        assert_eq!(second, Message::have(9));
    }

    #[tokio::test]
    async fn read_reports_truncation() {
        // declares a 10-byte body but the stream ends after 3
        let wire = vec![0, 0, 0, 10, 7, 0, 0];
        let mut cursor = std::io::Cursor::new(wire);
        assert_matches!(
            Message::read(&mut cursor).await,
            Err(Error::TruncatedPayload)
        );
    }

    #[test]
    fn bitfield_msb_first() {
        let bitfield = Bitfield::from_bytes(vec![0b1000_0000, 0b0000_0001]);
        assert!(bitfield.has_piece(0));
        assert!(!bitfield.has_piece(1));
        assert!(!bitfield.has_piece(8));
        assert!(bitfield.has_piece(15));
    }

    #[test]
    fn bitfield_set_is_cumulative() {
        let mut bitfield = Bitfield::from_piece_count(10);
        bitfield.set_piece(0);
        bitfield.set_piece(9);
        assert!(bitfield.has_piece(0));
        assert!(bitfield.has_piece(9));
        assert_eq!(bitfield.as_bytes(), &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn bitfield_out_of_range_is_absent() {
        let mut bitfield = Bitfield::from_piece_count(8);
        bitfield.set_piece(8); // no-op
        assert!(!bitfield.has_piece(8));
        assert!(!bitfield.has_piece(100));
    }

    #[test]
    fn union_ignores_spare_bytes() {
        let mut bitfield = Bitfield::from_piece_count(4);
        bitfield.union(&[0b1010_0000, 0xFF]);
        assert_eq!(bitfield.as_bytes(), &[0b1010_0000]);
        assert!(bitfield.has_piece(0));
        assert!(!bitfield.has_piece(1));
        assert!(bitfield.has_piece(2));
    }
}
