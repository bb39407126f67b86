//! # Wire Protocol Messages
//!
//! This module defines the serializable message types used by the market:
//!
//! | Surface | Type | Encoding |
//! |---------|------|----------|
//! | DHT record payload | [`User`] | protobuf (prost) |
//! | Local RPC | [`MarketRequest`] / [`MarketResponse`] | bincode |
//!
//! The `User` message is the unit that gets signed and embedded in DHT
//! records, so its encoding is fixed as protobuf for wire compatibility
//! with other market implementations. The local RPC rides on bincode with
//! a hard size limit; all deserialization of remote input goes through
//! [`deserialize_bounded`].

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Nominal ceiling for RPC message content (1 MiB).
/// Matches the value-size ceiling of the DHT overlay: a single record can
/// never legitimately outgrow this.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Wire-frame cap and deserialization limit: the content ceiling plus
/// slack for bincode envelope overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_FRAME_SIZE as u64) + 4096;

/// A holder advertisement: contact details and a quoted price.
///
/// `id` carries the DER-encoded RSA public key of the publisher and is the
/// only field bound to the entry signature; `name`, `ip`, `port` and
/// `price` are self-reported. Field numbers are part of the wire contract.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct User {
    /// DER-encoded RSA public key; doubles as the publisher identity.
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    /// Display name of the holder.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Advertised contact IP.
    #[prost(string, tag = "3")]
    pub ip: String,
    /// Advertised contact port.
    #[prost(int32, tag = "4")]
    pub port: i32,
    /// Quoted price for serving the file.
    #[prost(int64, tag = "5")]
    pub price: i64,
}

impl User {
    /// Convenience constructor for a holder advertisement. The `id` field
    /// is left empty; the publisher overwrites it with its own public key
    /// before signing, so callers never need to fill it in.
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: i32, price: i64) -> Self {
        Self {
            id: Vec::new(),
            name: name.into(),
            ip: ip.into(),
            port,
            price,
        }
    }
}

/// Request surface of the local marketplace RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MarketRequest {
    /// Advertise that this node holds `file_hash` and will serve it on the
    /// terms in `user`.
    RegisterFile { file_hash: String, user: User },
    /// List the current holders of `file_hash`.
    CheckHolders { file_hash: String },
}

/// Response surface of the local marketplace RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MarketResponse {
    /// The holder entry was published.
    Registered,
    /// Current holders, in record order.
    Holders(Vec<User>),
    /// The operation failed; `message` leads with the error category.
    Error { message: String },
}

/// Returns bincode options with size limits enforced.
/// Always used for deserializing remote input to bound allocation.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode_request(request: &MarketRequest) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(request)
}

pub fn decode_request(bytes: &[u8]) -> Result<MarketRequest, bincode::Error> {
    deserialize_bounded(bytes)
}

pub fn encode_response(response: &MarketResponse) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(response)
}

pub fn decode_response(bytes: &[u8]) -> Result<MarketResponse, bincode::Error> {
    deserialize_bounded(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn test_user() -> User {
        User {
            id: vec![7u8; 16],
            name: "alice".to_string(),
            ip: "203.0.113.7".to_string(),
            port: 8080,
            price: 416,
        }
    }

    #[test]
    fn user_protobuf_round_trip() {
        let user = test_user();
        let bytes = user.encode_to_vec();
        let decoded = User::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn user_default_has_empty_identity() {
        let user = User::new("bob", "198.51.100.2", 9090, 99);
        assert!(user.id.is_empty());
        assert_eq!(user.name, "bob");
    }

    #[test]
    fn request_round_trip() {
        let request = MarketRequest::RegisterFile {
            file_hash: "ab".repeat(32),
            user: test_user(),
        };
        let bytes = encode_request(&request).unwrap();
        match decode_request(&bytes).unwrap() {
            MarketRequest::RegisterFile { file_hash, user } => {
                assert_eq!(file_hash, "ab".repeat(32));
                assert_eq!(user, test_user());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn response_round_trip() {
        let response = MarketResponse::Holders(vec![test_user()]);
        let bytes = encode_response(&response).unwrap();
        match decode_response(&bytes).unwrap() {
            MarketResponse::Holders(holders) => assert_eq!(holders, vec![test_user()]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn malformed_request_rejected() {
        let garbage = [0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(decode_request(&garbage).is_err());

        let bytes = encode_request(&MarketRequest::CheckHolders {
            file_hash: "aa".repeat(32),
        })
        .unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode_request(truncated).is_err());
    }

    #[test]
    fn error_response_carries_message() {
        let response = MarketResponse::Error {
            message: "InvalidKey: not a digest".to_string(),
        };
        let bytes = encode_response(&response).unwrap();
        match decode_response(&bytes).unwrap() {
            MarketResponse::Error { message } => {
                assert!(message.starts_with("InvalidKey"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
