use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take,
    character::complete::{char, digit1},
    combinator::recognize,
    error::{Error as NomError, ErrorKind},
    multi::many_till,
    sequence::{delimited, pair, preceded},
};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

use crate::error::Error;

type BenResult<'a> = IResult<&'a [u8], Value>;

/// A decoded bencode value.
///
/// Dictionaries carry the SHA-1 digest of their raw encoding, which lets
/// the descriptor parser read the infohash straight off the `info` dict
/// without re-encoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dictionary {
        entries: HashMap<Vec<u8>, Value>,
        digest: [u8; 20],
    },
}

impl Value {
    /// Dictionary lookup; `None` for non-dictionaries and missing keys.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dictionary { entries, .. } => entries.get(key),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    fn parse_any(inp: &[u8]) -> BenResult<'_> {
        alt((
            Self::parse_bytes,
            Self::parse_integer,
            Self::parse_list,
            Self::parse_dict,
        ))
        .parse(inp)
    }

    fn parse_integer(start_inp: &[u8]) -> BenResult<'_> {
        let (inp, value) = delimited(
            char('i'),
            alt((recognize(pair(char('-'), digit1)), digit1)),
            char('e'),
        )
        .parse(start_inp)?;

        let value_str = std::str::from_utf8(value)
            .map_err(|_| nom::Err::Failure(NomError::new(start_inp, ErrorKind::Digit)))?;

        // i-0e and leading zeros are not valid bencode
        if value_str.starts_with("-0") || (value_str.starts_with('0') && value_str.len() > 1) {
            return Err(nom::Err::Failure(NomError::new(start_inp, ErrorKind::Digit)));
        }

        let value: i64 = value_str
            .parse()
            .map_err(|_| nom::Err::Failure(NomError::new(start_inp, ErrorKind::Digit)))?;
        Ok((inp, Value::Integer(value)))
    }

    fn parse_bytes(start_inp: &[u8]) -> BenResult<'_> {
        let (inp, length) = digit1(start_inp)?;
        let (inp, _) = char(':')(inp)?;

        let length: u64 = std::str::from_utf8(length)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| nom::Err::Failure(NomError::new(start_inp, ErrorKind::Digit)))?;

        let (inp, bytes) = take(length)(inp)?;
        Ok((inp, Value::Bytes(bytes.to_vec())))
    }

    fn parse_list(start_inp: &[u8]) -> BenResult<'_> {
        let (inp, (items, _)) =
            preceded(char('l'), many_till(Self::parse_any, char('e'))).parse(start_inp)?;
        Ok((inp, Value::List(items)))
    }

    fn parse_dict(start_inp: &[u8]) -> BenResult<'_> {
        let (inp, (pairs, _)) = preceded(
            char('d'),
            many_till(pair(Self::parse_bytes, Self::parse_any), char('e')),
        )
        .parse(start_inp)?;

        let raw = &start_inp[..start_inp.len() - inp.len()];
        let digest = Sha1::digest(raw).into();

        let entries = pairs
            .into_iter()
            .filter_map(|(key, value)| match key {
                // keys are always byte strings
                Value::Bytes(key) => Some((key, value)),
                _ => None,
            })
            .collect();

        Ok((inp, Value::Dictionary { entries, digest }))
    }
}

/// Parses a single bencode value covering the whole of `source`.
pub fn parse(source: &[u8]) -> Result<Value, Error> {
    let (rest, value) = Value::parse_any(source).map_err(|e| Error::Bencode(e.to_string()))?;
    if !rest.is_empty() {
        return Err(Error::Bencode("trailing bytes after bencode value".into()));
    }
    Ok(value)
}
