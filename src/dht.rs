//! # DHT Adapter
//!
//! This module wires the market's value layer to a Kademlia overlay. The
//! market core only ever consumes three things from the DHT: a put, a
//! draining search, and the hook that runs the [`MarketValidator`] against
//! records arriving from the network. Everything else about routing is the
//! overlay's business.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put_record(key, value)` | Store a record under a namespaced key |
//! | `search_record(key)` | Drain every candidate value observed for a key |
//!
//! ## Actor Architecture
//!
//! - [`KadDht`]: public handle for DHT operations, cheap to clone
//! - `DhtActor`: internal actor owning the libp2p `Swarm`
//! - Commands are sent via async channels; replies on oneshot channels
//!
//! ## Validation Hook
//!
//! The swarm runs Kademlia with store-inserts filtering, so every inbound
//! record surfaces to the actor before it can be stored. The actor rejects
//! records failing [`MarketValidator::validate`] and arbitrates admitted
//! ones against the already-stored value with
//! [`MarketValidator::select`], so the best replica survives locally.
//! Search results pass through the same validation before they reach
//! callers.
//!
//! ## In-Process Backend
//!
//! [`MemoryDht`] implements the same [`RecordDht`] trait over a shared
//! in-memory table with identical admission semantics. Cloning the handle
//! shares the table, which lets tests stand up several market nodes in one
//! process and exercise cross-publisher convergence without sockets.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::upgrade;
use libp2p::kad::store::{MemoryStore, RecordStore};
use libp2p::kad::{self, Record, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, identity, noise, ping, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, Transport};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::validator::{MarketValidator, ValidateError};

/// Kademlia stream protocol for the market overlay. Scoping the protocol
/// name keeps foreign kad networks out of this keyspace.
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/orcanet/market/kad/1.0.0");

/// Identify protocol version advertised to peers.
const IDENTIFY_PROTOCOL: &str = "orcanet/market/1.0.0";

/// Timeout for individual Kademlia queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between routing-table bootstrap rounds. Server discovery rides
/// on these plus identify address exchange.
const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(300);

/// Idle connections are closed after this long.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Command channel capacity for the DHT actor. Back-pressure applies when
/// full to prevent unbounded queue growth.
const DHT_COMMAND_CHANNEL_SIZE: usize = 256;

/// Error type for DHT adapter failures.
#[derive(Debug)]
pub enum DhtError {
    /// The overlay could not complete a search or put.
    Unavailable(String),
    /// The operation deadline elapsed.
    Timeout,
    /// The local validator refused the record before it left this node.
    Rejected(ValidateError),
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtError::Unavailable(msg) => write!(f, "DhtUnavailable: {msg}"),
            DhtError::Timeout => write!(f, "Timeout: DHT operation deadline exceeded"),
            DhtError::Rejected(reason) => write!(f, "record refused by validator: {reason}"),
        }
    }
}

impl std::error::Error for DhtError {}

/// The slice of DHT functionality the market core consumes.
///
/// Keys are full namespaced strings (`orcanet/market/<hex>`). A search
/// returns every candidate value the overlay produced for the key, already
/// filtered for admissibility; callers apply the longest/selection rule.
#[async_trait]
pub trait RecordDht: Send + Sync {
    async fn put_record(&self, key: String, value: Vec<u8>) -> Result<(), DhtError>;
    async fn search_record(&self, key: String) -> Result<Vec<Vec<u8>>, DhtError>;
}

/// Whether this node stores and serves records or only queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhtMode {
    Client,
    Server,
}

/// Startup configuration for the Kademlia adapter.
#[derive(Clone, Debug)]
pub struct KadDhtConfig {
    /// Multiaddr the overlay transport listens on.
    pub listen: Multiaddr,
    /// Bootstrap peers, each multiaddr carrying a `/p2p/<peer-id>` suffix.
    pub bootstrap: Vec<Multiaddr>,
    pub mode: DhtMode,
}

impl Default for KadDhtConfig {
    fn default() -> Self {
        Self {
            listen: "/ip4/0.0.0.0/tcp/44981"
                .parse()
                .expect("static multiaddr parses"),
            bootstrap: Vec::new(),
            mode: DhtMode::Server,
        }
    }
}

#[derive(libp2p::swarm::NetworkBehaviour)]
struct MarketBehaviour {
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

enum DhtCommand {
    Put {
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    Search {
        key: String,
        reply: oneshot::Sender<Result<Vec<Vec<u8>>, DhtError>>,
    },
}

/// Public handle for the Kademlia-backed DHT. Cheap to clone; all state
/// lives in the actor task.
#[derive(Clone)]
pub struct KadDht {
    commands: mpsc::Sender<DhtCommand>,
    local_peer_id: PeerId,
}

impl KadDht {
    /// Build the swarm, start listening, dial bootstrap peers, and spawn
    /// the actor task. Must be called from within a tokio runtime.
    pub fn spawn(host_key: identity::Keypair, config: KadDhtConfig) -> Result<Self, DhtError> {
        let local_peer_id = PeerId::from(host_key.public());

        let transport = tcp::tokio::Transport::default()
            .upgrade(upgrade::Version::V1)
            .authenticate(
                noise::Config::new(&host_key)
                    .map_err(|err| DhtError::Unavailable(err.to_string()))?,
            )
            .multiplex(yamux::Config::default())
            .boxed();

        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(QUERY_TIMEOUT);
        // Surface inbound records to the actor instead of storing blindly;
        // the validator decides admission.
        kad_config.set_record_filtering(kad::StoreInserts::FilterBoth);
        let store = MemoryStore::new(local_peer_id);
        let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
        kademlia.set_mode(Some(match config.mode {
            DhtMode::Client => kad::Mode::Client,
            DhtMode::Server => kad::Mode::Server,
        }));

        for addr in &config.bootstrap {
            let Some(peer_id) = peer_id_of(addr) else {
                warn!(%addr, "bootstrap multiaddr is missing a /p2p/ peer id, skipping");
                continue;
            };
            kademlia.add_address(&peer_id, addr.clone());
        }

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            host_key.public(),
        ));
        let ping = ping::Behaviour::new(ping::Config::new());
        let behaviour = MarketBehaviour {
            kademlia,
            identify,
            ping,
        };

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            libp2p::swarm::Config::with_tokio_executor()
                .with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT),
        );

        swarm
            .listen_on(config.listen.clone())
            .map_err(|err| DhtError::Unavailable(err.to_string()))?;

        for addr in &config.bootstrap {
            if let Err(err) = swarm.dial(addr.clone()) {
                warn!(%addr, error = %err, "failed to dial bootstrap peer");
            }
        }
        if !config.bootstrap.is_empty() {
            if let Err(err) = swarm.behaviour_mut().kademlia.bootstrap() {
                debug!(error = %err, "initial bootstrap deferred");
            }
        }

        info!(peer_id = %local_peer_id, mode = ?config.mode, "market DHT starting");

        let (commands, command_rx) = mpsc::channel(DHT_COMMAND_CHANNEL_SIZE);
        let actor = DhtActor {
            swarm,
            validator: MarketValidator,
            pending_puts: HashMap::new(),
            pending_searches: HashMap::new(),
        };
        tokio::spawn(actor.run(command_rx));

        Ok(Self {
            commands,
            local_peer_id,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

#[async_trait]
impl RecordDht for KadDht {
    async fn put_record(&self, key: String, value: Vec<u8>) -> Result<(), DhtError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(DhtCommand::Put { key, value, reply })
            .await
            .map_err(|_| DhtError::Unavailable("DHT actor has shut down".into()))?;
        response
            .await
            .map_err(|_| DhtError::Unavailable("DHT actor dropped the request".into()))?
    }

    async fn search_record(&self, key: String) -> Result<Vec<Vec<u8>>, DhtError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(DhtCommand::Search { key, reply })
            .await
            .map_err(|_| DhtError::Unavailable("DHT actor has shut down".into()))?;
        response
            .await
            .map_err(|_| DhtError::Unavailable("DHT actor dropped the request".into()))?
    }
}

struct PendingSearch {
    candidates: Vec<Vec<u8>>,
    reply: oneshot::Sender<Result<Vec<Vec<u8>>, DhtError>>,
}

struct DhtActor {
    swarm: Swarm<MarketBehaviour>,
    validator: MarketValidator,
    pending_puts: HashMap<kad::QueryId, oneshot::Sender<Result<(), DhtError>>>,
    pending_searches: HashMap<kad::QueryId, PendingSearch>,
}

impl DhtActor {
    async fn run(mut self, mut commands: mpsc::Receiver<DhtCommand>) {
        let mut bootstrap_interval = tokio::time::interval(BOOTSTRAP_INTERVAL);
        bootstrap_interval.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(DhtCommand::Put { key, value, reply }) => {
                        self.start_put(key, value, reply);
                    }
                    Some(DhtCommand::Search { key, reply }) => {
                        self.start_search(key, reply);
                    }
                    None => {
                        debug!("DHT actor shutting down");
                        break;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = bootstrap_interval.tick() => {
                    if let Err(err) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                        debug!(error = %err, "bootstrap round skipped");
                    }
                }
            }
        }
    }

    fn start_put(
        &mut self,
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), DhtError>>,
    ) {
        // Never ship a record the network would refuse.
        if let Err(reason) = self.validator.validate(&key, &value) {
            let _ = reply.send(Err(DhtError::Rejected(reason)));
            return;
        }
        let record = Record {
            key: RecordKey::new(&key),
            value,
            publisher: None,
            expires: None,
        };
        match self
            .swarm
            .behaviour_mut()
            .kademlia
            .put_record(record, kad::Quorum::One)
        {
            Ok(query_id) => {
                self.pending_puts.insert(query_id, reply);
            }
            Err(err) => {
                let _ = reply.send(Err(DhtError::Unavailable(err.to_string())));
            }
        }
    }

    fn start_search(
        &mut self,
        key: String,
        reply: oneshot::Sender<Result<Vec<Vec<u8>>, DhtError>>,
    ) {
        let query_id = self
            .swarm
            .behaviour_mut()
            .kademlia
            .get_record(RecordKey::new(&key));
        self.pending_searches.insert(
            query_id,
            PendingSearch {
                candidates: Vec::new(),
                reply,
            },
        );
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<MarketBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MarketBehaviourEvent::Kademlia(event)) => {
                self.handle_kad_event(event);
            }
            SwarmEvent::Behaviour(MarketBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                // Feed identified listen addresses into the routing table;
                // this is how freshly dialed peers become routable.
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(_) => {}
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "overlay listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(%peer_id, "peer connected");
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(%peer_id, "peer disconnected");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(?peer_id, %error, "outgoing connection failed");
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(found))) => {
                    if let Some(pending) = self.pending_searches.get_mut(&id) {
                        let key = String::from_utf8_lossy(found.record.key.as_ref()).into_owned();
                        match self.validator.validate(&key, &found.record.value) {
                            Ok(()) => pending.candidates.push(found.record.value),
                            Err(reason) => {
                                debug!(key, %reason, "dropping invalid replica from search")
                            }
                        }
                    }
                    if step.last {
                        self.finish_search(id);
                    }
                }
                kad::QueryResult::GetRecord(Ok(
                    kad::GetRecordOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    self.finish_search(id);
                }
                kad::QueryResult::GetRecord(Err(err)) => {
                    if let Some(pending) = self.pending_searches.remove(&id) {
                        let result = match err {
                            kad::GetRecordError::NotFound { .. } => Ok(pending.candidates),
                            other if pending.candidates.is_empty() => {
                                Err(DhtError::Unavailable(other.to_string()))
                            }
                            // Partial answers still count: the market layer
                            // works with whatever replicas were observed.
                            _ => Ok(pending.candidates),
                        };
                        let _ = pending.reply.send(result);
                    }
                }
                kad::QueryResult::PutRecord(Ok(kad::PutRecordOk { key })) => {
                    debug!(key = %String::from_utf8_lossy(key.as_ref()), "record published");
                    if let Some(reply) = self.pending_puts.remove(&id) {
                        let _ = reply.send(Ok(()));
                    }
                }
                kad::QueryResult::PutRecord(Err(err)) => {
                    if let Some(reply) = self.pending_puts.remove(&id) {
                        let _ = reply.send(Err(DhtError::Unavailable(err.to_string())));
                    }
                }
                kad::QueryResult::Bootstrap(Ok(_)) => {
                    debug!("bootstrap round complete");
                }
                kad::QueryResult::Bootstrap(Err(err)) => {
                    debug!(error = %err, "bootstrap round failed");
                }
                _ => {}
            },
            kad::Event::InboundRequest {
                request:
                    kad::InboundRequest::PutRecord {
                        source,
                        record: Some(record),
                        ..
                    },
            } => {
                self.admit_record(source, record);
            }
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!(%peer, "routing table updated");
            }
            _ => {}
        }
    }

    /// Drain any remaining query state and hand the collected candidates
    /// to the caller.
    fn finish_search(&mut self, id: kad::QueryId) {
        if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
            query.finish();
        }
        if let Some(pending) = self.pending_searches.remove(&id) {
            let _ = pending.reply.send(Ok(pending.candidates));
        }
    }

    /// Validation hook for records arriving from the network. Invalid
    /// records are dropped; valid ones are arbitrated against the stored
    /// value so the best replica survives locally.
    fn admit_record(&mut self, source: PeerId, record: Record) {
        let key = String::from_utf8_lossy(record.key.as_ref()).into_owned();
        if let Err(reason) = self.validator.validate(&key, &record.value) {
            debug!(%source, key, %reason, "rejected inbound record");
            return;
        }

        let existing = self
            .swarm
            .behaviour_mut()
            .kademlia
            .store_mut()
            .get(&record.key)
            .map(|stored| stored.into_owned());

        // The inbound record goes first so it survives exact ties; only a
        // strictly better stored value keeps its place.
        let admitted = match existing {
            Some(current) => {
                let candidates = [record.value.clone(), current.value.clone()];
                if self.validator.select(&key, &candidates) == 0 {
                    record
                } else {
                    current
                }
            }
            None => record,
        };

        if let Err(err) = self
            .swarm
            .behaviour_mut()
            .kademlia
            .store_mut()
            .put(admitted)
        {
            warn!(key, %err, "failed to store admitted record");
        } else {
            debug!(%source, key, "stored inbound record");
        }
    }
}

/// Extract the peer id from a `/p2p/`-suffixed multiaddr.
fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// In-process record table with the same admission semantics as the
/// networked adapter.
///
/// Clones share one table, so several market nodes in a single process see
/// one another's writes — the shape multi-publisher tests need. Also
/// serves as a standalone backend when no overlay is configured.
#[derive(Clone, Default)]
pub struct MemoryDht {
    records: Arc<parking_lot::RwLock<HashMap<String, Vec<u8>>>>,
    validator: MarketValidator,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordDht for MemoryDht {
    async fn put_record(&self, key: String, value: Vec<u8>) -> Result<(), DhtError> {
        self.validator
            .validate(&key, &value)
            .map_err(DhtError::Rejected)?;

        let mut records = self.records.write();
        // New value first: it survives exact ties, mirroring the
        // networked admission path.
        let admitted = match records.get(&key) {
            Some(current) => {
                let candidates = [value.clone(), current.clone()];
                if self.validator.select(&key, &candidates) == 0 {
                    value
                } else {
                    current.clone()
                }
            }
            None => value,
        };
        records.insert(key, admitted);
        Ok(())
    }

    async fn search_record(&self, key: String) -> Result<Vec<Vec<u8>>, DhtError> {
        Ok(self.records.read().get(&key).cloned().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_extraction() {
        let with_peer: Multiaddr =
            "/ip4/203.0.113.5/tcp/44981/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .parse()
                .unwrap();
        assert!(peer_id_of(&with_peer).is_some());

        let without_peer: Multiaddr = "/ip4/203.0.113.5/tcp/44981".parse().unwrap();
        assert!(peer_id_of(&without_peer).is_none());
    }

    #[tokio::test]
    async fn memory_dht_rejects_invalid_records() {
        let dht = MemoryDht::new();
        let key = crate::validator::namespaced(&"aa".repeat(32));
        let result = dht.put_record(key, vec![0u8; 12]).await;
        assert!(matches!(result, Err(DhtError::Rejected(_))));
        assert!(dht.is_empty());
    }

    #[tokio::test]
    async fn memory_dht_missing_key_returns_no_candidates() {
        let dht = MemoryDht::new();
        let key = crate::validator::namespaced(&"bb".repeat(32));
        let candidates = dht.search_record(key).await.unwrap();
        assert!(candidates.is_empty());
    }
}
