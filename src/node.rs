// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The node orchestrator: boots identity, persistence, trust, peer management, gossip and the
//! DHT on top of the TCP transport, wires the transport's inbound stream to a dispatcher, and
//! drives the background ticks (fanout, discovery, heartbeat, trust decay, DHT maintenance).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::config::{ConfigError, NodeConfig};
use crate::core::identity::{Identity, IdentityError};
use crate::core::persistence::{PersistenceStore, SledStore, StoreError};
use crate::core::types::{NodeId, Value};
use crate::monitoring::metrics::Metrics;
use crate::networking::dht::{DhtError, DhtParams, DhtTransport, DistributedHashTable};
use crate::networking::gossip::{GossipEngine, GossipParams, ReceiveOutcome};
use crate::networking::nat::{NatCollaborator, NullNat};
use crate::networking::peer_store::{PeerManager, PeerManagerParams};
use crate::networking::transport::tcp::{Inbound, TcpError, TcpTransport};
use crate::networking::trust::{TrustEngine, TrustParams};
use crate::networking::wire::message::{Message, MessageFactory, MessageType};

/// Orchestrator errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A configuration value was out of range.
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    /// The identity key file could not be loaded or created.
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    /// The persistence collaborator failed.
    #[error("persistence: {0}")]
    Store(#[from] StoreError),
    /// The TCP transport failed to bind.
    #[error("tcp transport: {0}")]
    Tcp(#[from] TcpError),
    /// The metrics registry failed to initialize.
    #[error("metrics: {0}")]
    Metrics(#[from] crate::monitoring::metrics::MetricsError),
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// [`DhtTransport`] implemented over the node's [`TcpTransport`]. DHT RPCs address peers by
/// `host:port`, while the TCP transport keys its connections by the verified [`NodeId`] learned
/// during handshake, so this keeps a small address-to-id cache and dials on first use (or redials
/// once if a cached connection has gone stale).
struct TcpDhtTransport {
    tcp: Arc<TcpTransport>,
    inbound_tx: mpsc::Sender<Inbound>,
    known: Mutex<HashMap<String, NodeId>>,
}

impl TcpDhtTransport {
    fn new(tcp: Arc<TcpTransport>, inbound_tx: mpsc::Sender<Inbound>) -> Self {
        Self {
            tcp,
            inbound_tx,
            known: Mutex::new(HashMap::new()),
        }
    }

    async fn dial(&self, address: &str) -> Result<NodeId, DhtError> {
        let node_id = self
            .tcp
            .connect(address, self.inbound_tx.clone())
            .await
            .map_err(|_| DhtError::Send)?;
        self.known.lock().await.insert(address.to_string(), node_id);
        Ok(node_id)
    }
}

#[async_trait]
impl DhtTransport for TcpDhtTransport {
    async fn send_message(&self, address: &str, message: Message) -> Result<(), DhtError> {
        let cached = self.known.lock().await.get(address).copied();
        let node_id = match cached {
            Some(id) => id,
            None => self.dial(address).await?,
        };
        match self.tcp.send_to_peer(node_id, message.clone()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let node_id = self.dial(address).await?;
                self.tcp
                    .send_to_peer(node_id, message)
                    .await
                    .map_err(|_| DhtError::Send)
            }
        }
    }
}

/// A running P2P node: the wired-together collaborators plus the background tasks that drive
/// them. Dropping this (after [`Node::shutdown`]) releases the bound socket.
pub struct Node {
    config: NodeConfig,
    identity: Arc<Identity>,
    store: Arc<dyn PersistenceStore>,
    trust: Arc<TrustEngine>,
    peers: Arc<PeerManager>,
    gossip: Arc<GossipEngine>,
    dht: Arc<DistributedHashTable>,
    tcp: Arc<TcpTransport>,
    nat: Arc<dyn NatCollaborator>,
    metrics: Arc<Metrics>,
    data_handlers: tokio::sync::RwLock<
        HashMap<String, Arc<dyn Fn(NodeId, &Value) + Send + Sync>>,
    >,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Snapshot of a node's running counters, for the application or a metrics scrape.
#[derive(Clone, Debug)]
pub struct NodeStats {
    /// Gossip engine counters.
    pub gossip: crate::networking::gossip::GossipStats,
    /// DHT counters.
    pub dht: crate::networking::dht::DhtStats,
    /// Number of peers in the `Active` connection state.
    pub active_peers: usize,
    /// Number of currently open TCP connections.
    pub tcp_connections: usize,
}

impl Node {
    /// Boot a node: identity, persistence, trust, peer manager, gossip, DHT, transport, in that
    /// order. Binds the TCP listener and spawns its accept loop, but does not yet dial bootstrap
    /// peers or start the periodic ticks; call [`Self::run`] for that.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        config.validate()?;

        let mut key_path = std::path::PathBuf::from(&config.data_dir);
        key_path.push("identity.key");
        let identity = Arc::new(Identity::load_or_generate(&key_path)?);

        let mut db_path = std::path::PathBuf::from(&config.data_dir);
        db_path.push("store");
        let store: Arc<dyn PersistenceStore> =
            Arc::new(SledStore::open(db_path.to_str().unwrap_or("store"))?);

        let trust = Arc::new(TrustEngine::new(
            store.clone(),
            TrustParams {
                initial_trust: config.initial_trust_score,
                min_trust: config.min_trust_threshold,
                max_trust: config.max_trust_score,
                decay_rate: config.trust_decay_rate,
                trusted_peers_threshold: config.trusted_peers_threshold,
            },
        ));

        let peers = Arc::new(
            PeerManager::new(
                identity.node_id(),
                store.clone(),
                PeerManagerParams {
                    max_peers: config.max_peers,
                    min_peers: config.min_peers,
                    peer_timeout_secs: config.peer_timeout_secs,
                    min_trust_threshold: config.min_trust_threshold,
                },
                config.bootstrap_nodes.clone(),
            )
            .await?,
        );

        let gossip = Arc::new(GossipEngine::new(
            identity.node_id(),
            store.clone(),
            peers.clone(),
            trust.clone(),
            GossipParams {
                fanout: config.gossip_fanout,
                gossip_interval_secs: config.gossip_interval_secs,
                message_cache_size: config.message_cache_size,
                trust_penalty_invalid: config.trust_penalty_invalid,
            },
        ));

        let listen_address = config.listen_address();
        let tcp = Arc::new(TcpTransport::new(
            identity.clone(),
            listen_address.clone(),
            Duration::from_secs_f64(config.connection_timeout_secs),
        ));

        let (inbound_tx, inbound_rx) = mpsc::channel(config.message_buffer_size);
        let dht_transport: Arc<dyn DhtTransport> =
            Arc::new(TcpDhtTransport::new(tcp.clone(), inbound_tx.clone()));
        let dht = Arc::new(DistributedHashTable::new(
            identity.node_id(),
            listen_address.clone(),
            DhtParams {
                k: config.dht_k,
                alpha: config.dht_alpha,
                replication_factor: config.dht_replication_factor,
                ttl_default_secs: config.dht_ttl_default_secs,
                rpc_timeout: Duration::from_secs_f64(config.dht_rpc_timeout_secs),
                max_lookup_iterations: config.dht_lookup_max_iterations,
            },
            dht_transport,
        ));

        let nat: Arc<dyn NatCollaborator> =
            Arc::new(NullNat::new(config.host.clone(), config.port));

        let metrics = Arc::new(Metrics::new()?);

        let node = Arc::new(Self {
            config,
            identity,
            store,
            trust,
            peers,
            gossip,
            dht,
            tcp: tcp.clone(),
            nat,
            metrics,
            data_handlers: tokio::sync::RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        {
            let node = node.clone();
            let tcp = tcp.clone();
            let bind_addr = node.config.listen_address();
            let accept_task = tokio::spawn(async move {
                if let Err(e) = tcp.listen(&bind_addr, inbound_tx).await {
                    error!(err = ?e, "tcp transport accept loop exited");
                }
            });
            node.tasks.lock().await.push(accept_task);
        }
        {
            let node = node.clone();
            let dispatch_task = tokio::spawn(async move {
                node.dispatch_loop(inbound_rx).await;
            });
            node.tasks.lock().await.push(dispatch_task);
        }

        info!(node = %node.identity.node_id(), addr = %node.config.listen_address(), "node started");
        Ok(node)
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Register a handler for `CUSTOM_DATA` messages carrying the given application-level `name`
    /// tag in their payload (see [`Self::send_to_peer`]). Only one handler per name is kept.
    pub async fn register_data_handler<F>(&self, name: &str, handler: F)
    where
        F: Fn(NodeId, &Value) + Send + Sync + 'static,
    {
        self.data_handlers
            .write()
            .await
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Dial every configured bootstrap node and start the periodic background ticks (gossip
    /// fanout, peer discovery, heartbeat, trust decay, DHT maintenance). Failed bootstrap dials
    /// are logged but do not prevent the node from running.
    pub async fn run(self: &Arc<Self>) {
        for addr in self.peers.bootstrap_nodes().to_vec() {
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.dial(&addr).await {
                    warn!(%addr, err = ?e, "bootstrap dial failed");
                }
            });
        }

        self.spawn_tick(self.gossip.interval(), {
            let node = self.clone();
            move || {
                let node = node.clone();
                async move { node.fanout_tick().await }
            }
        })
        .await;

        self.spawn_tick(
            Duration::from_secs_f64(self.config.peer_discovery_interval_secs),
            {
                let node = self.clone();
                move || {
                    let node = node.clone();
                    async move { node.discovery_tick().await }
                }
            },
        )
        .await;

        self.spawn_tick(Duration::from_secs_f64(self.config.heartbeat_interval_secs), {
            let node = self.clone();
            move || {
                let node = node.clone();
                async move { node.heartbeat_tick().await }
            }
        })
        .await;

        self.spawn_tick(
            Duration::from_secs_f64(self.config.trust_decay_interval_secs),
            {
                let node = self.clone();
                move || {
                    let node = node.clone();
                    async move {
                        if let Err(e) = node.trust.apply_trust_decay().await {
                            warn!(err = ?e, "trust decay round failed");
                        }
                    }
                }
            },
        )
        .await;

        self.spawn_tick(Duration::from_secs(30), {
            let node = self.clone();
            move || {
                let node = node.clone();
                async move { node.dht.run_maintenance().await }
            }
        })
        .await;
    }

    async fn spawn_tick<F, Fut>(self: &Arc<Self>, period: Duration, mut f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                f().await;
            }
        });
        self.tasks.lock().await.push(task);
    }

    async fn dial(self: &Arc<Self>, addr: &str) -> Result<(), TcpError> {
        let (tx, mut rx) = mpsc::channel(self.config.message_buffer_size);
        let peer_node_id = self.tcp.connect(addr, tx).await?;

        let mut handshake = MessageFactory::handshake(
            self.identity.node_id(),
            now_unix(),
            &self.identity.public_key_bytes(),
            &self.config.listen_address(),
        );
        handshake.sign(&self.identity).ok();
        let _ = self.tcp.send_to_peer(peer_node_id, handshake).await;

        let node = self.clone();
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                node.handle_inbound(inbound).await;
            }
        });
        Ok(())
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<Inbound>) {
        while let Some(inbound) = inbound_rx.recv().await {
            self.handle_inbound(inbound).await;
        }
    }

    /// Verify the message's signature (when the type requires one), classify it, and route it to
    /// gossip, the DHT, or a registered custom-data handler.
    async fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        let Inbound {
            from_node,
            from_addr,
            message,
        } = inbound;

        if message.msg_type != MessageType::Heartbeat {
            let verified = match self.peers.get_peer(from_node).await {
                Some(peer) => message.verify(&peer.public_key),
                None => false,
            };
            if !verified && message.msg_type != MessageType::Handshake {
                self.metrics.signature_invalid_total.inc();
                if let Err(e) = self
                    .trust
                    .on_invalid_message(from_node, self.config.trust_penalty_invalid)
                    .await
                {
                    warn!(err = ?e, "failed to penalize unverified message");
                }
                debug!(peer = %from_node, ty = ?message.msg_type, "dropping message with invalid signature");
                return;
            }
        }

        match message.msg_type {
            MessageType::Handshake => self.on_handshake(from_node, from_addr, &message).await,
            MessageType::HandshakeAck => {
                let _ = self
                    .peers
                    .add_peer(
                        from_node,
                        from_addr.to_string(),
                        message
                            .payload
                            .get("public_key")
                            .and_then(Value::as_bytes)
                            .map(<[u8]>::to_vec)
                            .unwrap_or_default(),
                        self.config.initial_trust_score,
                        true,
                    )
                    .await;
            }
            MessageType::Heartbeat => {
                let _ = self.peers.update_peer_activity(from_node).await;
            }
            MessageType::PeerDiscovery => self.on_peer_discovery(from_node).await,
            MessageType::TrustedPeersRequest => self.on_trusted_peers_request(from_node).await,
            MessageType::TrustUpdate => self.on_trust_update(from_node, &message).await,
            MessageType::Disconnect => {
                self.peers.remove_peer(from_node).await.ok();
                self.tcp.disconnect(from_node).await;
                info!(peer = %from_node, "peer disconnected");
            }
            MessageType::Gossip | MessageType::PeerAnnouncement | MessageType::CustomData => {
                self.on_gossip_or_custom(from_addr, message).await
            }
            MessageType::TrustedPeersResponse => {}
            MessageType::DhtStore
            | MessageType::DhtFindValue
            | MessageType::DhtDelete
            | MessageType::DhtStoreOk
            | MessageType::DhtFindValueResponse
            | MessageType::DhtDeleteOk => {
                self.dht.handle_message(message).await;
            }
        }
    }

    async fn on_handshake(self: &Arc<Self>, from_node: NodeId, from_addr: std::net::SocketAddr, message: &Message) {
        let public_key = message
            .payload
            .get("public_key")
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        if NodeId::from_public_key(&public_key) != from_node {
            warn!(peer = %from_node, "handshake public key does not match the authenticated connection; dropping");
            return;
        }
        let address = message
            .payload
            .get("address")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| from_addr.to_string());

        if let Err(e) = self
            .peers
            .add_peer(from_node, address, public_key, self.config.initial_trust_score, true)
            .await
        {
            warn!(err = ?e, "failed to admit handshaking peer");
            return;
        }
        self.dht.add_node(from_node, from_addr.to_string()).await;

        let known = self.peers.get_random_peers(10, &[from_node]).await;
        let peers_value = Value::List(
            known
                .into_iter()
                .map(|p| Value::Str(p.address))
                .collect(),
        );
        let mut ack = MessageFactory::handshake_ack(
            self.identity.node_id(),
            now_unix(),
            &self.identity.public_key_bytes(),
            peers_value,
        );
        if ack.sign(&self.identity).is_ok() {
            let _ = self.tcp.send_to_peer(from_node, ack.clone()).await;
        }
    }

    async fn on_peer_discovery(self: &Arc<Self>, from_node: NodeId) {
        let sample = self.peers.get_trusted_peers(0.6).await;
        let value = Value::List(
            sample
                .into_iter()
                .take(10)
                .map(|p| Value::Str(p.address))
                .collect(),
        );
        let mut reply = MessageFactory::peer_announcement(self.identity.node_id(), now_unix(), value);
        if reply.sign(&self.identity).is_ok() {
            let _ = self.tcp.send_to_peer(from_node, reply).await;
        }
    }

    async fn on_trusted_peers_request(self: &Arc<Self>, from_node: NodeId) {
        let peers = match self.trust.get_trusted_peers(Some(0.7)).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(err = ?e, "failed to load trusted peers");
                return;
            }
        };
        let value = Value::List(
            peers
                .into_iter()
                .take(20)
                .map(|p| Value::Str(p.address))
                .collect(),
        );
        let mut reply = MessageFactory::trusted_peers_response(self.identity.node_id(), now_unix(), value);
        if reply.sign(&self.identity).is_ok() {
            let _ = self.tcp.send_to_peer(from_node, reply).await;
        }
    }

    async fn on_trust_update(self: &Arc<Self>, from_node: NodeId, message: &Message) {
        let Some(target_hex) = message.payload.get("target_node_id").and_then(Value::as_str) else {
            return;
        };
        let Some(target) = NodeId::from_hex(target_hex) else {
            return;
        };
        let recommended_trust = message
            .payload
            .get("trust_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        if let Err(e) = self
            .trust
            .apply_transitive_trust(from_node, target, recommended_trust)
            .await
        {
            warn!(err = ?e, "failed to apply transitive trust recommendation");
        }
    }

    async fn on_gossip_or_custom(self: &Arc<Self>, from_addr: std::net::SocketAddr, message: Message) {
        let msg_type = message.msg_type;
        let origin = message.sender_id;
        let name = message
            .payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let data = message.payload.get("data").cloned();

        match self.gossip.receive(message, Some(from_addr)).await {
            Ok(ReceiveOutcome::Delivered) | Ok(ReceiveOutcome::DeliveredAndQueued) => {
                if msg_type == MessageType::CustomData {
                    if let (Some(name), Some(data)) = (name, data) {
                        if let Some(handler) = self.data_handlers.read().await.get(&name).cloned() {
                            handler(origin, &data);
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(err = ?e, "gossip receive failed"),
        }
    }

    /// Wrap `payload` in a `GOSSIP` message with the given hop `ttl` and hand it to the gossip
    /// engine for epidemic propagation.
    pub async fn broadcast(&self, payload: Value, ttl: i32) -> Result<(), StoreError> {
        let mut message = MessageFactory::gossip(self.identity.node_id(), now_unix(), payload, ttl);
        let _ = message.sign(&self.identity);
        self.gossip.broadcast(message).await
    }

    /// Send `payload` directly to one peer as `CUSTOM_DATA`, bypassing gossip fanout. `name`
    /// tags the payload for [`Self::register_data_handler`] on the receiving end.
    pub async fn send_to_peer(&self, node_id: NodeId, name: &str, payload: Value) -> Result<(), TcpError> {
        let mut data = crate::core::types::Payload::new();
        data.insert("name".into(), Value::Str(name.to_string()));
        data.insert("data".into(), payload);
        let mut message = Message::new(
            MessageType::CustomData,
            self.identity.node_id(),
            now_unix(),
            data,
            self.config.message_ttl,
        );
        message.sign(&self.identity).ok();
        self.tcp.send_to_peer(node_id, message).await
    }

    /// Ask `node_id`'s trusted-peer list directly (request/response, not gossip).
    pub async fn request_trusted_peers(&self, node_id: NodeId) -> Result<(), TcpError> {
        let mut message = MessageFactory::trusted_peers_request(self.identity.node_id(), now_unix());
        message.sign(&self.identity).ok();
        self.tcp.send_to_peer(node_id, message).await
    }

    /// Unicast this node's own trusted-peer sample to every active peer.
    pub async fn share_trusted_peers(&self) -> Result<(), StoreError> {
        let trusted = self.trust.get_trusted_peers(None).await?;
        let value = Value::List(trusted.into_iter().map(|p| Value::Str(p.address)).collect());
        let active = self.peers.get_active_peers().await;
        for peer in active {
            let mut message =
                MessageFactory::trusted_peers_response(self.identity.node_id(), now_unix(), value.clone());
            message.sign(&self.identity).ok();
            let _ = self.tcp.send_to_peer(peer.node_id, message).await;
        }
        Ok(())
    }

    /// Store `key` -> `value` in the DHT.
    pub async fn dht_store(&self, key: &str, value: Vec<u8>, ttl: Option<f64>) {
        self.dht.store(key, value, ttl).await;
    }

    /// Retrieve `key` from the DHT (local cache first, then an iterative network lookup).
    pub async fn dht_retrieve(&self, key: &str) -> Option<Vec<u8>> {
        self.dht.retrieve(key, false).await
    }

    /// Current counters across gossip, the DHT, peer management and the transport.
    pub async fn get_stats(&self) -> NodeStats {
        NodeStats {
            gossip: self.gossip.stats().await,
            dht: self.dht.stats().await,
            active_peers: self.peers.get_active_peers().await.len(),
            tcp_connections: self.tcp.connection_count().await,
        }
    }

    async fn fanout_tick(self: &Arc<Self>) {
        let batch = self.gossip.drain_fanout_batch(self.config.gossip_fanout * 4).await;
        for (peer, message) in batch {
            let _ = self.tcp.send_to_peer(peer.node_id, message).await;
        }
    }

    async fn discovery_tick(self: &Arc<Self>) {
        if !self.peers.needs_more_peers().await {
            return;
        }
        for addr in self.peers.discover_peers().await {
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.dial(&addr).await {
                    debug!(%addr, err = ?e, "discovery dial failed");
                }
            });
        }
    }

    async fn heartbeat_tick(self: &Arc<Self>) {
        let active = self.peers.get_active_peers().await;
        let evicted = self.peers.sweep_timeouts().await;
        if !evicted.is_empty() {
            self.metrics.peer_timeouts_total.inc_by(evicted.len() as u64);
        }
        for node_id in evicted {
            if let Err(e) = self
                .trust
                .on_peer_timeout(node_id, self.config.trust_penalty_invalid)
                .await
            {
                warn!(err = ?e, "failed to penalize timed-out peer");
            }
            self.tcp.disconnect(node_id).await;
        }
        for peer in &active {
            let mut heartbeat = MessageFactory::heartbeat(self.identity.node_id(), now_unix());
            let _ = heartbeat.sign(&self.identity);
            let _ = self.tcp.send_to_peer(peer.node_id, heartbeat).await;
        }
        self.sync_metrics(active.len()).await;
    }

    /// Refresh the gauges on [`Self::metrics`] from a fresh snapshot of the gossip and DHT
    /// counters and the peer tables. Called once per heartbeat tick; not on every mutation, since
    /// none of these numbers are latency-sensitive.
    async fn sync_metrics(&self, active_peer_count: usize) {
        self.metrics.active_peers.set(active_peer_count as i64);
        let known = self.store.get_all_peers().await.map(|p| p.len()).unwrap_or(0);
        self.metrics.known_peers.set(known as i64);

        let gossip_stats = self.gossip.stats().await;
        self.metrics.gossip_received.set(gossip_stats.received as i64);
        self.metrics.gossip_duplicates.set(gossip_stats.duplicates as i64);
        self.metrics.gossip_expired.set(gossip_stats.expired as i64);
        self.metrics
            .gossip_untrusted_drops
            .set(gossip_stats.untrusted_drops as i64);
        self.metrics.gossip_fanned_out.set(gossip_stats.fanned_out as i64);

        let dht_stats = self.dht.stats().await;
        self.metrics.dht_stores.set(dht_stats.stores as i64);
        self.metrics.dht_retrievals.set(dht_stats.retrievals as i64);
        self.metrics.dht_replications.set(dht_stats.replications as i64);
        self.metrics.dht_expirations.set(dht_stats.expirations as i64);
    }

    /// This node's metrics handle, for an application that wants to plug its own exporter in
    /// front of [`crate::monitoring::metrics::Metrics::registry`].
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Stop all background ticks in strict reverse boot order and release the bound socket.
    /// Pending DHT RPC futures resolve as cancelled once their `oneshot` senders are dropped along
    /// with the DHT itself.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(task) = tasks.pop() {
            task.abort();
        }
        info!(node = %self.identity.node_id(), "node shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16, data_dir: &std::path::Path, bootstrap: Vec<String>) -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.host = "127.0.0.1".to_string();
        cfg.port = port;
        cfg.data_dir = data_dir.to_string_lossy().to_string();
        cfg.bootstrap_nodes = bootstrap;
        cfg.gossip_interval_secs = 3600.0;
        cfg.peer_discovery_interval_secs = 3600.0;
        cfg.heartbeat_interval_secs = 3600.0;
        cfg.trust_decay_interval_secs = 3600.0;
        cfg
    }

    #[tokio::test]
    async fn single_node_boots_and_reports_stats() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start(test_config(0, dir.path(), vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = node.get_stats().await;
        assert_eq!(stats.active_peers, 0);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn two_nodes_handshake_over_a_bootstrap_dial() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port_b = listener.local_addr().unwrap().port();
        drop(listener);

        let node_b = Node::start(test_config(port_b, dir_b.path(), vec![])).await.unwrap();
        node_b.run().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let node_a = Node::start(test_config(
            0,
            dir_a.path(),
            vec![format!("127.0.0.1:{port_b}")],
        ))
        .await
        .unwrap();
        node_a.run().await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats_a = node_a.get_stats().await;
        let stats_b = node_b.get_stats().await;
        assert_eq!(stats_a.active_peers, 1);
        assert_eq!(stats_b.active_peers, 1);

        node_a.shutdown().await;
        node_b.shutdown().await;
    }
}
