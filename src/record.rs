//! # Record Codec
//!
//! Encoding and decoding of the byte value stored at a market DHT key.
//!
//! ## Layout
//!
//! ```text
//! record     := entry{1..} timestamp
//! entry      := msg_len:u16_le sig_len:u16_le msg:bytes[msg_len] sig:bytes[sig_len]
//! timestamp  := u64_le                    ; Unix UTC seconds
//! msg        := protobuf-serialized User
//! sig        := RSA signature over the exact msg bytes
//! ```
//!
//! The decoder is strict: entries must tile the record exactly, ending
//! eight bytes before the end, with no gaps, no overlap, and no trailing
//! padding. An entry that would reach past the timestamp boundary is an
//! error, never a silent truncation.
//!
//! Each decoded [`Entry`] keeps the exact message bytes alongside the
//! parsed [`User`]: signatures cover those bytes verbatim, and re-encoding
//! a record must not disturb fields this implementation does not know
//! about.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::messages::User;

/// Width of the trailing record timestamp.
pub const TIMESTAMP_LEN: usize = 8;

/// Width of an entry's two u16 length fields.
pub const ENTRY_HEADER_LEN: usize = 4;

/// Largest value either u16 length field can carry.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Error type for records that cannot be tiled into entries plus a
/// trailing timestamp.
#[derive(Debug)]
pub enum RecordError {
    /// The value is shorter than the trailing timestamp.
    Truncated { len: usize },
    /// The record carries a timestamp but no entries.
    Empty,
    /// An entry header declares a zero-length message.
    EmptyEntry { offset: usize },
    /// An entry header was cut off or its body reaches past the
    /// timestamp boundary.
    OutOfBounds { offset: usize },
    /// A message or signature exceeds the u16 length-field range.
    Oversized { len: usize },
    /// The entry's message bytes are not a valid `User`.
    User(prost::DecodeError),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::Truncated { len } => {
                write!(f, "record of {len} bytes is shorter than its timestamp")
            }
            RecordError::Empty => write!(f, "record holds no entries"),
            RecordError::EmptyEntry { offset } => {
                write!(f, "zero-length entry at offset {offset}")
            }
            RecordError::OutOfBounds { offset } => {
                write!(f, "entry at offset {offset} reaches past the record bounds")
            }
            RecordError::Oversized { len } => {
                write!(f, "field of {len} bytes exceeds the u16 length range")
            }
            RecordError::User(err) => write!(f, "entry message is not a valid User: {err}"),
        }
    }
}

impl std::error::Error for RecordError {}

/// One publisher's contribution to a record: the serialized `User` it
/// signed, the signature, and the decoded view of the message.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    /// Decoded view of `message`. Untrusted until the signature is
    /// verified against `message`.
    pub user: User,
    /// The exact bytes the signature covers.
    pub message: Vec<u8>,
    /// RSA signature over `message` by the key in `user.id`.
    pub signature: Vec<u8>,
}

impl Entry {
    /// Build an entry from its wire parts, parsing the message and
    /// checking both fields against the u16 length range.
    pub fn from_parts(message: Vec<u8>, signature: Vec<u8>) -> Result<Self, RecordError> {
        if message.len() > MAX_FIELD_LEN {
            return Err(RecordError::Oversized { len: message.len() });
        }
        if signature.len() > MAX_FIELD_LEN {
            return Err(RecordError::Oversized { len: signature.len() });
        }
        let user = User::decode(message.as_slice()).map_err(RecordError::User)?;
        Ok(Self {
            user,
            message,
            signature,
        })
    }

    /// Bytes this entry occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_LEN + self.message.len() + self.signature.len()
    }
}

/// A record split into its entries and trailing timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedRecord {
    pub entries: Vec<Entry>,
    /// Unix UTC seconds stamped by the last writer.
    pub timestamp: u64,
}

/// Encode one entry as `u16_le(msg_len) u16_le(sig_len) msg sig`.
pub fn encode_entry(message: &[u8], signature: &[u8]) -> Result<Vec<u8>, RecordError> {
    if message.len() > MAX_FIELD_LEN {
        return Err(RecordError::Oversized { len: message.len() });
    }
    if signature.len() > MAX_FIELD_LEN {
        return Err(RecordError::Oversized { len: signature.len() });
    }
    let mut out = Vec::with_capacity(ENTRY_HEADER_LEN + message.len() + signature.len());
    out.extend_from_slice(&(message.len() as u16).to_le_bytes());
    out.extend_from_slice(&(signature.len() as u16).to_le_bytes());
    out.extend_from_slice(message);
    out.extend_from_slice(signature);
    Ok(out)
}

/// Concatenate entries in order and append the timestamp.
pub fn encode_record(entries: &[Entry], timestamp_secs: u64) -> Result<Vec<u8>, RecordError> {
    let body_len: usize = entries.iter().map(Entry::encoded_len).sum();
    let mut out = Vec::with_capacity(body_len + TIMESTAMP_LEN);
    for entry in entries {
        out.extend_from_slice(&encode_entry(&entry.message, &entry.signature)?);
    }
    out.extend_from_slice(&timestamp_secs.to_le_bytes());
    Ok(out)
}

/// Decode a record into entries and the trailing timestamp.
///
/// Walks the prefix before the timestamp, consuming one
/// `(header, msg, sig)` group at a time; every entry must parse as a
/// `User` and the walk must land exactly on the timestamp boundary.
pub fn decode_record(bytes: &[u8]) -> Result<DecodedRecord, RecordError> {
    if bytes.len() < TIMESTAMP_LEN {
        return Err(RecordError::Truncated { len: bytes.len() });
    }
    let (body, timestamp_bytes) = bytes.split_at(bytes.len() - TIMESTAMP_LEN);
    let timestamp = u64::from_le_bytes(
        timestamp_bytes
            .try_into()
            .expect("split_at leaves exactly TIMESTAMP_LEN bytes"),
    );

    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if body.len() - offset < ENTRY_HEADER_LEN {
            return Err(RecordError::OutOfBounds { offset });
        }
        let msg_len =
            u16::from_le_bytes([body[offset], body[offset + 1]]) as usize;
        let sig_len =
            u16::from_le_bytes([body[offset + 2], body[offset + 3]]) as usize;
        if msg_len == 0 {
            return Err(RecordError::EmptyEntry { offset });
        }
        let total = ENTRY_HEADER_LEN + msg_len + sig_len;
        if offset + total > body.len() {
            return Err(RecordError::OutOfBounds { offset });
        }
        let message = body[offset + ENTRY_HEADER_LEN..offset + ENTRY_HEADER_LEN + msg_len].to_vec();
        let signature = body[offset + ENTRY_HEADER_LEN + msg_len..offset + total].to_vec();
        let user = User::decode(message.as_slice()).map_err(RecordError::User)?;
        entries.push(Entry {
            user,
            message,
            signature,
        });
        offset += total;
    }

    if entries.is_empty() {
        return Err(RecordError::Empty);
    }

    Ok(DecodedRecord { entries, timestamp })
}

/// Current time as Unix UTC seconds; the value stamped onto records.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
