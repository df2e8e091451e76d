use crate::error::Error;

pub const PSTR: &str = "BitTorrent protocol";
pub const PSTR_LEN: u8 = PSTR.len() as u8; // always 19
pub const HANDSHAKE_LEN: usize = 68;

/// The fixed 68-byte opening exchange: protocol name, infohash, peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PSTR_LEN;
        buf[1..20].copy_from_slice(PSTR.as_bytes());
        // buf[20..28] stays zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != HANDSHAKE_LEN || buf[0] != PSTR_LEN {
            return Err(Error::MalformedHandshake);
        }
        if &buf[1..20] != PSTR.as_bytes() {
            return Err(Error::MalformedHandshake);
        }

        let info_hash =
            <[u8; 20]>::try_from(&buf[28..48]).map_err(|_| Error::MalformedHandshake)?;
        let peer_id = <[u8; 20]>::try_from(&buf[48..68]).map_err(|_| Error::MalformedHandshake)?;
        Ok(Self { info_hash, peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn serialize_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let buf = handshake.serialize();

        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], PSTR_LEN);
        assert_eq!(&buf[1..20], PSTR.as_bytes());
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &[1u8; 20]);
        assert_eq!(&buf[48..68], &[2u8; 20]);
    }

    #[test]
    fn roundtrip_is_fixed_point() {
        let original = Handshake::new([7u8; 20], [8u8; 20]);
        let decoded = Handshake::deserialize(&original.serialize()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn rejects_wrong_pstr_len() {
        let mut buf = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        buf[0] = 18;
        assert_matches!(
            Handshake::deserialize(&buf),
            Err(Error::MalformedHandshake)
        );
    }

    #[test]
    fn rejects_wrong_protocol_name() {
        let mut buf = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        buf[1] = b'X';
        assert_matches!(
            Handshake::deserialize(&buf),
            Err(Error::MalformedHandshake)
        );
    }

    #[test]
    fn rejects_short_input() {
        let buf = [0u8; 67];
        assert_matches!(
            Handshake::deserialize(&buf),
            Err(Error::MalformedHandshake)
        );
    }

    #[test]
    fn reserved_bytes_are_ignored_on_decode() {
        let mut buf = Handshake::new([3u8; 20], [4u8; 20]).serialize();
        buf[20..28].fill(0xFF);
        let decoded = Handshake::deserialize(&buf).unwrap();
        assert_eq!(decoded.info_hash, [3u8; 20]);
        assert_eq!(decoded.peer_id, [4u8; 20]);
    }
}
