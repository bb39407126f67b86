//! # Marketplace Core
//!
//! The operations local clients drive against the registry:
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `register_file(hash, user)` | Merge this node's holder entry into the shared record |
//! | `check_holders(hash)` | List every current holder of a file |
//!
//! ## Publishing
//!
//! Registering is a single read-modify-write pass: fetch the best current
//! record, drop any previous entry by this publisher, overwrite the
//! caller's `id` with the node's own public key, sign the serialized user,
//! append, stamp with the current time, and write back. Entries belonging
//! to other publishers are carried over byte-for-byte, so their signatures
//! (and any fields this node does not model) survive intact.
//!
//! ## Convergence
//!
//! Two publishers racing on one key can each produce a record missing the
//! other's newest entry. Every registered file is therefore re-published
//! on a fixed cadence by a background task; together with the
//! longest-valid selection rule on the DHT side, the union of honest
//! entries tends to survive.
//!
//! ## Deadlines
//!
//! Every DHT call is bounded by the configured operation timeout. On
//! expiry the pass is abandoned and `Timeout` surfaces to the caller; no
//! partial record is written.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::dht::{DhtError, RecordDht};
use crate::identity::{KeyError, Keypair};
use crate::messages::User;
use crate::record::{decode_record, encode_record, unix_now_secs, Entry, RecordError};
use crate::validator::{is_file_key, namespaced};

/// Deadline applied to each DHT operation.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the background re-publish of registered files.
const REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Error type for marketplace operations.
#[derive(Debug)]
pub enum MarketError {
    /// The file hash is not a 64-character SHA-256 hex digest. Rejected
    /// before any network traffic.
    InvalidKey(String),
    /// The local private key failed to sign the entry.
    Signing(KeyError),
    /// The entry could not be framed (oversized message or signature).
    Record(RecordError),
    /// The DHT adapter failed.
    Dht(DhtError),
    /// The operation deadline elapsed.
    Timeout,
}

impl fmt::Display for MarketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketError::InvalidKey(key) => {
                write!(f, "InvalidKey: {key:?} is not a SHA-256 hex digest")
            }
            // KeyError already renders its category name.
            MarketError::Signing(err) => write!(f, "{err}"),
            MarketError::Record(err) => write!(f, "MalformedRecord: {err}"),
            MarketError::Dht(err) => write!(f, "{err}"),
            MarketError::Timeout => write!(f, "Timeout: operation deadline exceeded"),
        }
    }
}

impl std::error::Error for MarketError {}

impl From<DhtError> for MarketError {
    fn from(err: DhtError) -> Self {
        match err {
            DhtError::Timeout => MarketError::Timeout,
            other => MarketError::Dht(other),
        }
    }
}

/// The marketplace surface exposed to local clients.
///
/// Owns the publisher and reader passes plus the refresh task. The keypair
/// and DHT handle are injected, never ambient, so several independent
/// nodes can coexist in one process.
pub struct Market {
    keypair: Arc<Keypair>,
    dht: Arc<dyn RecordDht>,
    op_timeout: Duration,
    registered: Arc<Mutex<HashMap<String, User>>>,
    refresher: tokio::task::JoinHandle<()>,
}

impl Market {
    /// Build a market over the given identity and DHT handle with the
    /// default operation timeout.
    pub fn new(keypair: Arc<Keypair>, dht: Arc<dyn RecordDht>) -> Self {
        Self::with_timeout(keypair, dht, DEFAULT_OP_TIMEOUT)
    }

    pub fn with_timeout(
        keypair: Arc<Keypair>,
        dht: Arc<dyn RecordDht>,
        op_timeout: Duration,
    ) -> Self {
        let registered: Arc<Mutex<HashMap<String, User>>> = Arc::new(Mutex::new(HashMap::new()));
        let refresher = tokio::spawn(refresh_loop(
            keypair.clone(),
            dht.clone(),
            registered.clone(),
            op_timeout,
        ));
        Self {
            keypair,
            dht,
            op_timeout,
            registered,
            refresher,
        }
    }

    /// Advertise that this node holds `file_hash` on the terms in `user`.
    ///
    /// The caller's `user.id` is ignored and replaced with this node's
    /// public key before signing. On success the file joins the refresh
    /// set and is re-published periodically until the market is dropped.
    pub async fn register_file(&self, file_hash: &str, user: User) -> Result<(), MarketError> {
        if !is_file_key(file_hash) {
            return Err(MarketError::InvalidKey(file_hash.to_string()));
        }
        let published = publish_entry(
            &self.keypair,
            self.dht.as_ref(),
            self.op_timeout,
            file_hash,
            user,
        )
        .await?;
        self.registered
            .lock()
            .insert(file_hash.to_string(), published);
        Ok(())
    }

    /// List the current holders of `file_hash`, in record order.
    ///
    /// A missing key or an undecodable replica yields an empty list, not
    /// an error; network-layer failures do surface.
    pub async fn check_holders(&self, file_hash: &str) -> Result<Vec<User>, MarketError> {
        if !is_file_key(file_hash) {
            return Err(MarketError::InvalidKey(file_hash.to_string()));
        }
        let key = namespaced(file_hash);
        let candidates = timeout(self.op_timeout, self.dht.search_record(key.clone()))
            .await
            .map_err(|_| MarketError::Timeout)??;

        let Some(best) = candidates.into_iter().max_by_key(Vec::len) else {
            return Ok(Vec::new());
        };
        match decode_record(&best) {
            Ok(record) => Ok(record.entries.into_iter().map(|entry| entry.user).collect()),
            Err(err) => {
                debug!(key, %err, "treating undecodable record as empty holder list");
                Ok(Vec::new())
            }
        }
    }

    /// Number of files this node currently refreshes.
    pub fn registered_files(&self) -> usize {
        self.registered.lock().len()
    }
}

impl Drop for Market {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

/// One publisher pass: read the best current record, replace our entry,
/// re-sign, stamp, and write back. Returns the user as published (with
/// `id` filled in) for the refresh set.
async fn publish_entry(
    keypair: &Keypair,
    dht: &dyn RecordDht,
    op_timeout: Duration,
    file_hash: &str,
    mut user: User,
) -> Result<User, MarketError> {
    let key = namespaced(file_hash);

    let candidates = timeout(op_timeout, dht.search_record(key.clone()))
        .await
        .map_err(|_| MarketError::Timeout)??;
    let current = candidates
        .into_iter()
        .max_by_key(Vec::len)
        .unwrap_or_default();

    // A corrupt replica must never block a local republish; start from an
    // empty entry list instead.
    let mut entries = match decode_record(&current) {
        Ok(record) => record.entries,
        Err(err) => {
            if !current.is_empty() {
                debug!(key, %err, "replacing undecodable record");
            }
            Vec::new()
        }
    };

    // One entry per publisher per key: drop any previous entry of ours,
    // then bind the advertisement to our identity before signing.
    let own_id = keypair.public_key_bytes();
    entries.retain(|entry| entry.user.id != own_id);
    user.id = own_id.to_vec();

    let message = user.encode_to_vec();
    let signature = keypair.sign(&message).map_err(MarketError::Signing)?;
    entries.push(Entry::from_parts(message, signature).map_err(MarketError::Record)?);

    let value = encode_record(&entries, unix_now_secs()).map_err(MarketError::Record)?;
    timeout(op_timeout, dht.put_record(key, value))
        .await
        .map_err(|_| MarketError::Timeout)??;

    Ok(user)
}

/// Re-publish every registered file on a fixed cadence. Entries lost to
/// races or DHT eviction reappear on the next round.
async fn refresh_loop(
    keypair: Arc<Keypair>,
    dht: Arc<dyn RecordDht>,
    registered: Arc<Mutex<HashMap<String, User>>>,
    op_timeout: Duration,
) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    interval.tick().await; // skip the immediate tick

    loop {
        interval.tick().await;
        let snapshot: Vec<(String, User)> = registered
            .lock()
            .iter()
            .map(|(hash, user)| (hash.clone(), user.clone()))
            .collect();
        for (file_hash, user) in snapshot {
            match publish_entry(&keypair, dht.as_ref(), op_timeout, &file_hash, user).await {
                Ok(_) => debug!(file = file_hash, "holder entry refreshed"),
                Err(err) => warn!(file = file_hash, %err, "holder refresh failed"),
            }
        }
    }
}
