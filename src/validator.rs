//! # Record Validator
//!
//! The admission predicate and replica tie-breaker for market records.
//! Every DHT node runs the validator against inbound records before
//! storing them; the selection rule decides which of several competing
//! replicas for the same key survives.
//!
//! ## Admission
//!
//! A record is admissible when:
//!
//! 1. the key (namespace prefix stripped) is a 64-character hex SHA-256;
//! 2. the value tiles into entries plus an 8-byte trailing timestamp;
//! 3. every entry's `user.id` decodes to an RSA public key and its
//!    signature verifies over the entry's exact message bytes;
//! 4. no two entries share a `user.id`;
//! 5. the trailing timestamp is not ahead of the local clock.
//!
//! ## Selection
//!
//! Largest valid record wins; a larger trailing timestamp breaks length
//! ties. Honest publishers only ever extend the shared record, so a longer
//! replica is a superset of a shorter one, and the timestamp orders
//! concurrent extensions of equal size.

use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use crate::identity::{decode_public_key, verify_signature};
use crate::record::{decode_record, unix_now_secs, RecordError, TIMESTAMP_LEN};

/// Namespace prefix prepended to every market key crossing the DHT
/// boundary.
pub const KEY_NAMESPACE: &str = "orcanet/market/";

/// Forward clock tolerance for record timestamps, in seconds. Zero: a
/// record stamped ahead of the local clock is rejected outright.
pub const MAX_FUTURE_SKEW_SECS: u64 = 0;

/// Length of a file key: a SHA-256 digest in lowercase hex.
pub const FILE_KEY_LEN: usize = 64;

/// Error type naming the reason a record was refused admission.
#[derive(Debug)]
pub enum ValidateError {
    /// The key is not a 64-character hex SHA-256 digest.
    InvalidKey,
    /// The value could not be tiled into entries plus a timestamp.
    Malformed(RecordError),
    /// An entry's `user.id` is not a parseable RSA public key.
    BadIdentity,
    /// An entry's signature failed verification.
    BadSignature,
    /// Two entries in the record share a `user.id`.
    DuplicatePublisher,
    /// The trailing timestamp is ahead of the local clock.
    FutureTimestamp { timestamp: u64, now: u64 },
}

impl fmt::Display for ValidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidateError::InvalidKey => {
                write!(f, "InvalidKey: key is not a SHA-256 hex digest")
            }
            ValidateError::Malformed(err) => write!(f, "MalformedRecord: {err}"),
            ValidateError::BadIdentity => {
                write!(f, "BadIdentity: entry id is not an RSA public key")
            }
            ValidateError::BadSignature => {
                write!(f, "BadSignature: entry signature does not verify")
            }
            ValidateError::DuplicatePublisher => {
                write!(f, "DuplicatePublisher: two entries share one public key")
            }
            ValidateError::FutureTimestamp { timestamp, now } => {
                write!(f, "FutureTimestamp: record stamped {timestamp} but local clock is {now}")
            }
        }
    }
}

impl std::error::Error for ValidateError {}

/// Strip the market namespace prefix from a key, when present.
pub fn strip_namespace(key: &str) -> &str {
    key.strip_prefix(KEY_NAMESPACE).unwrap_or(key)
}

/// Prefix a file hash with the market namespace for the DHT boundary.
pub fn namespaced(file_hash: &str) -> String {
    format!("{KEY_NAMESPACE}{file_hash}")
}

/// Whether `key` has the shape of a SHA-256 digest: exactly 64 hex chars.
pub fn is_file_key(key: &str) -> bool {
    key.len() == FILE_KEY_LEN && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// The market's record validator: admission predicate plus replica
/// selection.
#[derive(Clone, Copy, Debug, Default)]
pub struct MarketValidator;

impl MarketValidator {
    /// Check a record for admissibility under the rules above.
    ///
    /// `key` may arrive with or without the namespace prefix; the DHT
    /// layer hands over fully prefixed keys in practice.
    pub fn validate(&self, key: &str, value: &[u8]) -> Result<(), ValidateError> {
        if !is_file_key(strip_namespace(key)) {
            return Err(ValidateError::InvalidKey);
        }

        let record = decode_record(value).map_err(ValidateError::Malformed)?;

        let mut publishers: HashSet<&[u8]> = HashSet::with_capacity(record.entries.len());
        for entry in &record.entries {
            if !publishers.insert(entry.user.id.as_slice()) {
                return Err(ValidateError::DuplicatePublisher);
            }
            let public = decode_public_key(&entry.user.id).ok_or(ValidateError::BadIdentity)?;
            if !verify_signature(&public, &entry.message, &entry.signature) {
                return Err(ValidateError::BadSignature);
            }
        }

        let now = unix_now_secs();
        if record.timestamp > now + MAX_FUTURE_SKEW_SECS {
            return Err(ValidateError::FutureTimestamp {
                timestamp: record.timestamp,
                now,
            });
        }

        Ok(())
    }

    /// Pick the best of several competing record values for one key.
    ///
    /// Returns the index of the longest valid candidate, breaking length
    /// ties with the larger trailing timestamp. Candidates failing
    /// [`validate`](Self::validate) are skipped; when none pass, index 0
    /// is returned and the caller drops the key.
    pub fn select(&self, key: &str, candidates: &[Vec<u8>]) -> usize {
        let mut best_index = 0;
        let mut best_len = 0usize;
        let mut best_timestamp = 0u64;

        for (index, candidate) in candidates.iter().enumerate() {
            if let Err(reason) = self.validate(key, candidate) {
                debug!(key, index, %reason, "skipping invalid candidate");
                continue;
            }
            // validate guarantees at least TIMESTAMP_LEN bytes.
            let tail: [u8; TIMESTAMP_LEN] = candidate[candidate.len() - TIMESTAMP_LEN..]
                .try_into()
                .expect("validated record carries a full timestamp");
            let timestamp = u64::from_le_bytes(tail);

            let longer = candidate.len() > best_len;
            let later_tie = candidate.len() == best_len && timestamp > best_timestamp;
            if longer || later_tie {
                best_index = index;
                best_len = candidate.len();
                best_timestamp = timestamp;
            }
        }

        best_index
    }
}
