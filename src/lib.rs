//! # OrcaNet Market - File-Holdings Marketplace Registry
//!
//! A peer-to-peer registry in which nodes advertise that they hold (and
//! will serve, for a quoted price) a content-addressed file, and other
//! nodes discover every current holder. Advertisements live in a
//! Kademlia DHT under keys of the form `orcanet/market/<sha256-hex>`;
//! each value is a signed, append-extendable, multi-publisher record.
//!
//! ## Architecture
//!
//! The value layer rides on top of a generic Kademlia overlay:
//!
//! - Records are opaque bytes to the DHT; the market validator decides
//!   admission and arbitrates between competing replicas
//! - Publishers extend the shared record rather than rewriting it; the
//!   longest valid replica wins, latest timestamp breaking ties
//! - There is no consensus round: convergence comes from periodic
//!   re-publishing plus the selection rule
//!
//! ## Trust Model
//!
//! - A publisher's identity is its RSA public key, embedded in each entry
//! - Every entry is signed over its exact serialized bytes; the validator
//!   is the only trust boundary
//! - Holder contact fields (`name`, `ip`, `port`, `price`) are
//!   self-reported; only `id` is cryptographically bound
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | RSA keypairs, PEM persistence, signing and verification |
//! | `messages` | `User` wire message, local RPC types, bounded decoding |
//! | `record` | Record/entry codec with the trailing timestamp |
//! | `validator` | Admission predicate and replica selection |
//! | `dht` | Kademlia adapter (actor + handle) and in-process backend |
//! | `market` | Publisher, reader, and the marketplace facade |
//! | `rpc` | Length-prefixed RPC server and typed client |

mod dht;
mod identity;
mod market;
mod messages;
mod record;
mod rpc;
mod validator;

pub use dht::{DhtError, DhtMode, KadDht, KadDhtConfig, MemoryDht, RecordDht, KAD_PROTOCOL};
pub use identity::{decode_public_key, verify_signature, KeyError, Keypair, DEFAULT_KEY_BITS};
pub use market::{Market, MarketError, DEFAULT_OP_TIMEOUT};
pub use messages::{MarketRequest, MarketResponse, User, MAX_FRAME_SIZE};
pub use record::{
    decode_record, encode_entry, encode_record, unix_now_secs, DecodedRecord, Entry, RecordError,
    TIMESTAMP_LEN,
};
pub use rpc::{serve, MarketClient, RpcError, DEFAULT_RPC_PORT};
pub use validator::{
    is_file_key, namespaced, strip_namespace, MarketValidator, ValidateError, KEY_NAMESPACE,
    MAX_FUTURE_SKEW_SECS,
};
