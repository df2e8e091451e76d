use std::path::Path;

use crate::bencode::{self, Value};
use crate::error::Error;

/// Everything the download engine needs from a `.torrent` descriptor.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: usize,
    pub length: usize,
    pub name: String,
}

impl Torrent {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let root = bencode::parse(data)?;

        let announce = string_field(&root, b"announce")?;
        let info = root
            .get(b"info")
            .ok_or_else(|| invalid("missing 'info' dictionary"))?;
        let Value::Dictionary { digest, .. } = info else {
            return Err(invalid("'info' is not a dictionary"));
        };
        let info_hash = *digest;

        let name = string_field(info, b"name")?;
        let piece_length = int_field(info, b"piece length")?;
        let length = int_field(info, b"length")?;

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing 'pieces' field"))?;
        if pieces.len() % 20 != 0 {
            return Err(invalid("'pieces' is not a multiple of 20 bytes"));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(Torrent {
            announce,
            info_hash,
            piece_hashes,
            piece_length,
            length,
            name,
        })
    }

    /// Absolute byte range `[begin, end)` of a piece within the content.
    /// The final piece is clipped to the total length.
    pub fn piece_bounds(&self, index: usize) -> (usize, usize) {
        let begin = index * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);
        (begin, end)
    }

    pub fn piece_size(&self, index: usize) -> usize {
        let (begin, end) = self.piece_bounds(index);
        end - begin
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }
}

fn invalid(msg: &str) -> Error {
    Error::InvalidDescriptor(msg.to_string())
}

fn string_field(dict: &Value, key: &[u8]) -> Result<String, Error> {
    let bytes = dict
        .get(key)
        .and_then(Value::as_bytes)
        .ok_or_else(|| invalid(&format!("missing '{}'", String::from_utf8_lossy(key))))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| invalid(&format!("'{}' is not utf-8", String::from_utf8_lossy(key))))
}

fn int_field(dict: &Value, key: &[u8]) -> Result<usize, Error> {
    let value = dict
        .get(key)
        .and_then(Value::as_integer)
        .ok_or_else(|| invalid(&format!("missing '{}'", String::from_utf8_lossy(key))))?;
    usize::try_from(value)
        .map_err(|_| invalid(&format!("'{}' is negative", String::from_utf8_lossy(key))))
}
