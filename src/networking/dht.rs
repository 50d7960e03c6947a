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

//! Kademlia-style distributed hash table: a 160-bit XOR routing table built from SHA-1 digests,
//! local key/value storage with TTL expiry and replication bookkeeping, and the iterative
//! `FIND_VALUE` lookup and STORE/DELETE replication RPCs that drive it over the network.
//!
//! The 160-bit address space here is distinct from [`crate::core::types::NodeId`]'s 64-bit
//! prefix space; the two are never compared directly. A node's position in this routing table is
//! its [`DhtId::from_node_id`] digest, not its `NodeId` itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::core::types::{DhtValue, NodeId, Payload, Value};
use crate::networking::wire::message::{Message, MessageError, MessageType};

const ADDRESS_BITS: usize = 160;
const ADDRESS_BYTES: usize = 20;

/// DHT errors.
#[derive(Debug, Error)]
pub enum DhtError {
    /// No response arrived before the per-RPC timeout.
    #[error("dht rpc timed out")]
    RpcTimeout,
    /// The RPC's response channel was dropped, generally because the DHT was shut down while
    /// the request was outstanding.
    #[error("dht rpc cancelled")]
    Cancelled,
    /// The transport collaborator failed to hand off the message.
    #[error("dht send failed")]
    Send,
    /// The envelope failed to build or parse.
    #[error("message: {0}")]
    Message(#[from] MessageError),
}

/// A point-to-point message sender the DHT uses to issue RPCs and replies. Implemented by the
/// node orchestrator over whichever transport is actually bound (typically the TCP transport,
/// since DHT RPCs are request/response rather than fire-and-forget).
#[async_trait]
pub trait DhtTransport: Send + Sync {
    /// Deliver `message` to the peer at `address`.
    async fn send_message(&self, address: &str, message: Message) -> Result<(), DhtError>;
}

/// A 160-bit address-space identifier, derived from a node id or a storage key via SHA-1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DhtId([u8; ADDRESS_BYTES]);

impl DhtId {
    /// Place a node in the address space by hashing its overlay [`NodeId`].
    pub fn from_node_id(id: NodeId) -> Self {
        Self(sha1_digest(id.as_bytes()))
    }

    /// Place a storage key in the address space.
    pub fn from_key(key: &str) -> Self {
        Self(sha1_digest(key.as_bytes()))
    }

    /// Lowercase hex representation (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &DhtId) -> [u8; ADDRESS_BYTES] {
        let mut out = [0u8; ADDRESS_BYTES];
        for i in 0..ADDRESS_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }
}

fn sha1_digest(data: &[u8]) -> [u8; ADDRESS_BYTES] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; ADDRESS_BYTES];
    out.copy_from_slice(&digest);
    out
}

/// Number of significant bits in an XOR distance (Python's `int.bit_length()`); zero for an
/// all-zero distance.
fn bit_length(distance: &[u8; ADDRESS_BYTES]) -> usize {
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            return (ADDRESS_BYTES - i) * 8 - byte.leading_zeros() as usize;
        }
    }
    0
}

/// Bucket index for a given XOR distance: bucket 0 holds distance 0, otherwise
/// `min(159, bit_length(distance) - 1)`.
fn bucket_index_for_distance(distance: &[u8; ADDRESS_BYTES]) -> usize {
    let len = bit_length(distance);
    if len == 0 {
        0
    } else {
        (len - 1).min(ADDRESS_BITS - 1)
    }
}

/// A node as known to the DHT's routing table: its overlay identity, network address, and when
/// it was last seen active.
#[derive(Clone, Debug, PartialEq)]
pub struct DhtNodeInfo {
    /// Overlay node id.
    pub node_id: NodeId,
    /// `host:port` address.
    pub address: String,
    /// Unix-seconds timestamp of the last contact.
    pub last_seen: f64,
}

struct KBucket {
    capacity: usize,
    nodes: Vec<DhtNodeInfo>,
    replacement_cache: Vec<DhtNodeInfo>,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Vec::new(),
            replacement_cache: Vec::new(),
        }
    }

    /// Returns `true` if admitted into the live set (updated or newly inserted), `false` if the
    /// bucket is full and the node only landed in the replacement cache.
    fn add_node(&mut self, node: DhtNodeInfo) -> bool {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.node_id == node.node_id) {
            *existing = node;
            return true;
        }
        if self.nodes.len() < self.capacity {
            self.nodes.push(node);
            return true;
        }
        self.replacement_cache.push(node);
        if self.replacement_cache.len() > self.capacity {
            self.replacement_cache.remove(0);
        }
        false
    }

    fn remove_node(&mut self, node_id: NodeId) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.node_id == node_id) {
            self.nodes.remove(pos);
            if !self.replacement_cache.is_empty() {
                self.nodes.push(self.replacement_cache.remove(0));
            }
            true
        } else {
            false
        }
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }
}

/// The XOR-distance routing table: `ADDRESS_BITS` k-buckets indexed by distance magnitude from
/// the local node.
struct RoutingTable {
    self_id: DhtId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    fn new(self_id: DhtId, k: usize) -> Self {
        Self {
            self_id,
            buckets: (0..ADDRESS_BITS).map(|_| KBucket::new(k)).collect(),
        }
    }

    fn add_node(&mut self, node_id: NodeId, address: String, now: f64) -> bool {
        if DhtId::from_node_id(node_id) == self.self_id {
            return false;
        }
        let distance = self.self_id.distance(&DhtId::from_node_id(node_id));
        let idx = bucket_index_for_distance(&distance);
        self.buckets[idx].add_node(DhtNodeInfo {
            node_id,
            address,
            last_seen: now,
        })
    }

    fn remove_node(&mut self, node_id: NodeId) -> bool {
        let distance = self.self_id.distance(&DhtId::from_node_id(node_id));
        let idx = bucket_index_for_distance(&distance);
        self.buckets[idx].remove_node(node_id)
    }

    fn find_closest(&self, target: &DhtId, count: usize) -> Vec<DhtNodeInfo> {
        let mut all: Vec<(DhtId, &DhtNodeInfo)> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .map(|n| (DhtId::from_node_id(n.node_id), n))
            .collect();
        all.sort_by_key(|(id, _)| id.distance(target));
        all.into_iter().take(count).map(|(_, n)| n.clone()).collect()
    }

    fn total_nodes(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    fn non_empty_buckets(&self) -> usize {
        self.buckets.iter().filter(|b| !b.nodes.is_empty()).count()
    }
}

/// Tuning knobs for [`DistributedHashTable`], mirroring the relevant
/// [`crate::core::config::NodeConfig`] fields.
#[derive(Clone, Copy, Debug)]
pub struct DhtParams {
    /// Bucket size.
    pub k: usize,
    /// Lookup/replication concurrency.
    pub alpha: usize,
    /// Number of closest nodes that receive STORE/DELETE replication.
    pub replication_factor: usize,
    /// Default TTL applied to values stored without an explicit one.
    pub ttl_default_secs: f64,
    /// Per-RPC timeout.
    pub rpc_timeout: Duration,
    /// Bound on iterative lookup rounds.
    pub max_lookup_iterations: usize,
}

/// Running counters exposed for monitoring, mirroring the distilled source's own statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct DhtStats {
    /// Local `store` calls.
    pub stores: u64,
    /// Local `retrieve` calls.
    pub retrievals: u64,
    /// Replication rounds performed.
    pub replications: u64,
    /// Local entries dropped as expired.
    pub expirations: u64,
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn new_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

enum FindValueOutcome {
    Value(Vec<u8>),
    CloserNodes(Vec<DhtNodeInfo>),
}

/// Kademlia-style distributed hash table: routing table, local storage, and the RPC/lookup
/// machinery that replicates and resolves keys across the network.
pub struct DistributedHashTable {
    self_id: NodeId,
    self_dht_id: DhtId,
    address: String,
    params: DhtParams,
    transport: Arc<dyn DhtTransport>,
    routing: RwLock<RoutingTable>,
    storage: RwLock<HashMap<String, DhtValue>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Payload>>>,
    stats: Mutex<DhtStats>,
}

impl DistributedHashTable {
    /// Build a DHT rooted at `self_id`/`address`, using `transport` to issue and answer RPCs.
    pub fn new(
        self_id: NodeId,
        address: String,
        params: DhtParams,
        transport: Arc<dyn DhtTransport>,
    ) -> Self {
        let self_dht_id = DhtId::from_node_id(self_id);
        Self {
            self_id,
            self_dht_id,
            address,
            params,
            transport,
            routing: RwLock::new(RoutingTable::new(self_dht_id, params.k)),
            storage: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            stats: Mutex::new(DhtStats::default()),
        }
    }

    /// This node's position in the 160-bit address space.
    pub fn self_dht_id(&self) -> DhtId {
        self.self_dht_id
    }

    /// Current counters.
    pub async fn stats(&self) -> DhtStats {
        *self.stats.lock().await
    }

    /// Add or refresh a node in the routing table; self-additions are ignored.
    pub async fn add_node(&self, node_id: NodeId, address: String) -> bool {
        self.routing.write().await.add_node(node_id, address, now_unix())
    }

    /// Remove a node from the routing table.
    pub async fn remove_node(&self, node_id: NodeId) -> bool {
        self.routing.write().await.remove_node(node_id)
    }

    /// The `count` routing-table nodes closest to `target`.
    pub async fn find_closest_nodes(&self, target: DhtId, count: usize) -> Vec<DhtNodeInfo> {
        self.routing.read().await.find_closest(&target, count)
    }

    /// Every key currently held locally.
    pub async fn stored_keys(&self) -> Vec<String> {
        self.storage.read().await.keys().cloned().collect()
    }

    /// Routing-table occupancy summary, mirroring the distilled source's own bucket report.
    pub async fn bucket_occupancy(&self) -> (usize, usize) {
        let routing = self.routing.read().await;
        (routing.total_nodes(), routing.non_empty_buckets())
    }

    /// Store `key` -> `value` locally, then best-effort replicate it to the closest known nodes.
    pub async fn store(&self, key: &str, value: Vec<u8>, ttl: Option<f64>) {
        let ttl = Some(ttl.unwrap_or(self.params.ttl_default_secs));
        let now = now_unix();
        {
            let mut storage = self.storage.write().await;
            let mut replicas = std::collections::BTreeSet::new();
            replicas.insert(self.self_id);
            storage.insert(
                key.to_string(),
                DhtValue {
                    key: key.to_string(),
                    value: value.clone(),
                    timestamp: now,
                    ttl,
                    replicas,
                },
            );
        }
        self.stats.lock().await.stores += 1;
        self.replicate_value(key, &value, ttl, now).await;
    }

    async fn replicate_value(&self, key: &str, value: &[u8], ttl: Option<f64>, timestamp: f64) {
        let key_hash = DhtId::from_key(key);
        let closest = self
            .routing
            .read()
            .await
            .find_closest(&key_hash, self.params.replication_factor);
        let mut replicated_by = Vec::new();
        for node in &closest {
            if node.node_id == self.self_id {
                continue;
            }
            match self.send_store_rpc(node, key, value, ttl, timestamp).await {
                Ok(true) => replicated_by.push(node.node_id),
                Ok(false) => {}
                Err(e) => trace!(peer = %node.node_id, err = %e, "dht store replication failed"),
            }
        }
        if !replicated_by.is_empty() {
            if let Some(entry) = self.storage.write().await.get_mut(key) {
                entry.replicas.extend(replicated_by);
            }
        }
        self.stats.lock().await.replications += 1;
    }

    /// Retrieve `key`. A local, unexpired hit returns immediately; otherwise (unless
    /// `local_only`) an iterative network lookup is performed.
    pub async fn retrieve(&self, key: &str, local_only: bool) -> Option<Vec<u8>> {
        self.stats.lock().await.retrievals += 1;
        {
            let mut storage = self.storage.write().await;
            if let Some(entry) = storage.get(key) {
                if !entry.is_expired(now_unix()) {
                    return Some(entry.value.clone());
                }
                storage.remove(key);
                self.stats.lock().await.expirations += 1;
            }
        }
        if local_only {
            return None;
        }
        self.find_value(key).await
    }

    /// Remove `key` locally and ask the replication-closest nodes to drop it too.
    pub async fn delete(&self, key: &str) -> bool {
        let existed = self.storage.write().await.remove(key).is_some();
        let key_hash = DhtId::from_key(key);
        let closest = self
            .routing
            .read()
            .await
            .find_closest(&key_hash, self.params.replication_factor);
        for node in &closest {
            if node.node_id == self.self_id {
                continue;
            }
            if let Err(e) = self.send_delete_rpc(node, key).await {
                trace!(peer = %node.node_id, err = %e, "dht delete replication failed");
            }
        }
        existed
    }

    async fn find_value(&self, key: &str) -> Option<Vec<u8>> {
        let key_hash = DhtId::from_key(key);
        let mut queried: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
        queried.insert(self.self_id);

        for _ in 0..self.params.max_lookup_iterations {
            let candidates = self.routing.read().await.find_closest(&key_hash, self.params.k);
            let to_query: Vec<DhtNodeInfo> = candidates
                .into_iter()
                .filter(|n| !queried.contains(&n.node_id))
                .take(self.params.alpha)
                .collect();
            if to_query.is_empty() {
                break;
            }
            for n in &to_query {
                queried.insert(n.node_id);
            }

            let outcomes = futures::future::join_all(
                to_query.iter().map(|n| self.send_find_value_rpc(n, key, &key_hash)),
            )
            .await;

            let mut fresh_nodes = Vec::new();
            for outcome in outcomes {
                match outcome {
                    Ok(FindValueOutcome::Value(v)) => return Some(v),
                    Ok(FindValueOutcome::CloserNodes(nodes)) => fresh_nodes.extend(nodes),
                    Err(e) => trace!(err = %e, "dht find_value rpc failed"),
                }
            }
            if fresh_nodes.is_empty() {
                break;
            }
            let now = now_unix();
            let mut routing = self.routing.write().await;
            for node in fresh_nodes {
                routing.add_node(node.node_id, node.address, now);
            }
        }
        None
    }

    async fn issue_rpc(&self, address: &str, message: Message, request_id: String) -> Result<Payload, DhtError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        if let Err(e) = self.transport.send_message(address, message).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }
        let result = tokio::time::timeout(self.params.rpc_timeout, rx).await;
        self.pending.lock().await.remove(&request_id);
        match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(DhtError::Cancelled),
            Err(_) => Err(DhtError::RpcTimeout),
        }
    }

    async fn send_store_rpc(
        &self,
        node: &DhtNodeInfo,
        key: &str,
        value: &[u8],
        ttl: Option<f64>,
        timestamp: f64,
    ) -> Result<bool, DhtError> {
        let request_id = new_request_id();
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.clone()));
        payload.insert("key".into(), Value::Str(key.to_string()));
        payload.insert("value".into(), Value::Bytes(value.to_vec()));
        if let Some(ttl) = ttl {
            payload.insert("ttl".into(), Value::from_f64(ttl));
        }
        payload.insert("timestamp".into(), Value::from_f64(timestamp));
        payload.insert("sender_address".into(), Value::Str(self.address.clone()));
        let message = Message::new(MessageType::DhtStore, self.self_id, now_unix(), payload, 1);

        let response = self.issue_rpc(&node.address, message, request_id).await?;
        Ok(response.get("stored").and_then(as_bool).unwrap_or(false))
    }

    async fn send_find_value_rpc(
        &self,
        node: &DhtNodeInfo,
        key: &str,
        key_hash: &DhtId,
    ) -> Result<FindValueOutcome, DhtError> {
        let request_id = new_request_id();
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.clone()));
        payload.insert("key".into(), Value::Str(key.to_string()));
        payload.insert("key_hash".into(), Value::Str(key_hash.to_hex()));
        payload.insert("sender_address".into(), Value::Str(self.address.clone()));
        let message = Message::new(MessageType::DhtFindValue, self.self_id, now_unix(), payload, 1);

        let response = self.issue_rpc(&node.address, message, request_id).await?;
        if let Some(value) = response.get("value").and_then(Value::as_bytes) {
            return Ok(FindValueOutcome::Value(value.to_vec()));
        }
        let nodes = response
            .get("closer_nodes")
            .and_then(Value::as_list)
            .map(parse_node_list)
            .unwrap_or_default();
        Ok(FindValueOutcome::CloserNodes(nodes))
    }

    async fn send_delete_rpc(&self, node: &DhtNodeInfo, key: &str) -> Result<(), DhtError> {
        let request_id = new_request_id();
        let key_hash = DhtId::from_key(key);
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.clone()));
        payload.insert("key_hash".into(), Value::Str(key_hash.to_hex()));
        payload.insert("sender_address".into(), Value::Str(self.address.clone()));
        let message = Message::new(MessageType::DhtDelete, self.self_id, now_unix(), payload, 1);
        self.issue_rpc(&node.address, message, request_id).await?;
        Ok(())
    }

    /// Dispatch an inbound DHT message: a request is answered directly, a response resolves the
    /// matching pending RPC future (if one is still outstanding; an expired one is a no-op).
    pub async fn handle_message(&self, message: Message) {
        match message.msg_type {
            MessageType::DhtStore => self.handle_store(message).await,
            MessageType::DhtFindValue => self.handle_find_value(message).await,
            MessageType::DhtDelete => self.handle_delete(message).await,
            MessageType::DhtStoreOk | MessageType::DhtFindValueResponse | MessageType::DhtDeleteOk => {
                self.complete_pending(message).await
            }
            other => warn!(?other, "dht received a non-dht message type"),
        }
    }

    async fn complete_pending(&self, message: Message) {
        let Some(request_id) = message.payload.get("request_id").and_then(Value::as_str) else {
            return;
        };
        if let Some(tx) = self.pending.lock().await.remove(request_id) {
            let _ = tx.send(message.payload);
        }
    }

    async fn handle_store(&self, message: Message) {
        let payload = &message.payload;
        let (Some(key), Some(value)) = (
            payload.get("key").and_then(Value::as_str),
            payload.get("value").and_then(Value::as_bytes),
        ) else {
            return;
        };
        let ttl = payload.get("ttl").and_then(Value::as_f64);
        let timestamp = payload.get("timestamp").and_then(Value::as_f64).unwrap_or_else(now_unix);
        let mut replicas = std::collections::BTreeSet::new();
        replicas.insert(message.sender_id);
        self.storage.write().await.insert(
            key.to_string(),
            DhtValue {
                key: key.to_string(),
                value: value.to_vec(),
                timestamp,
                ttl,
                replicas,
            },
        );
        if let Some(addr) = payload.get("sender_address").and_then(Value::as_str) {
            self.routing.write().await.add_node(message.sender_id, addr.to_string(), now_unix());
        }
        self.reply(&message, MessageType::DhtStoreOk, |p| {
            p.insert("stored".into(), Value::Bool(true));
        })
        .await;
    }

    async fn handle_find_value(&self, message: Message) {
        let payload = &message.payload;
        let Some(key_hash) = payload.get("key_hash").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let local_hit = {
            let storage = self.storage.read().await;
            storage
                .values()
                .find(|v| DhtId::from_key(&v.key).to_hex() == key_hash && !v.is_expired(now_unix()))
                .map(|v| v.value.clone())
        };
        match local_hit {
            Some(value) => {
                self.reply(&message, MessageType::DhtFindValueResponse, move |p| {
                    p.insert("value".into(), Value::Bytes(value.clone()));
                })
                .await;
            }
            None => {
                let target = DhtId(hex_to_20(&key_hash));
                let closer = self.routing.read().await.find_closest(&target, self.params.k);
                self.reply(&message, MessageType::DhtFindValueResponse, move |p| {
                    p.insert("closer_nodes".into(), node_list_to_value(&closer));
                })
                .await;
            }
        }
    }

    async fn handle_delete(&self, message: Message) {
        let Some(key_hash) = message.payload.get("key_hash").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let mut storage = self.storage.write().await;
        storage.retain(|k, _| DhtId::from_key(k).to_hex() != key_hash);
        drop(storage);
        self.reply(&message, MessageType::DhtDeleteOk, |p| {
            p.insert("deleted".into(), Value::Bool(true));
        })
        .await;
    }

    async fn reply<F>(&self, request: &Message, msg_type: MessageType, fill: F)
    where
        F: FnOnce(&mut Payload),
    {
        let Some(request_id) = request.payload.get("request_id").and_then(Value::as_str) else {
            return;
        };
        let Some(to) = request.payload.get("sender_address").and_then(Value::as_str) else {
            return;
        };
        let mut payload = Payload::new();
        payload.insert("request_id".into(), Value::Str(request_id.to_string()));
        fill(&mut payload);
        let response = Message::new(msg_type, self.self_id, now_unix(), payload, 1);
        if let Err(e) = self.transport.send_message(to, response).await {
            warn!(err = %e, "failed to send dht rpc reply");
        }
    }

    /// Drop expired local entries and republish any entry with less than 25% of its TTL
    /// remaining. Intended to run on a periodic tick (default every 60 seconds).
    pub async fn run_maintenance(&self) {
        let now = now_unix();
        let mut to_republish = Vec::new();
        let mut expired_count = 0u64;
        {
            let mut storage = self.storage.write().await;
            let mut expired = Vec::new();
            for (key, entry) in storage.iter() {
                if entry.is_expired(now) {
                    expired.push(key.clone());
                    continue;
                }
                if let Some(ttl) = entry.ttl {
                    let remaining = entry.timestamp + ttl - now;
                    if remaining > 0.0 && remaining < ttl * 0.25 {
                        to_republish.push((key.clone(), entry.value.clone(), entry.ttl));
                    }
                }
            }
            expired_count = expired.len() as u64;
            for key in expired {
                storage.remove(&key);
            }
        }
        if expired_count > 0 {
            self.stats.lock().await.expirations += expired_count;
        }
        for (key, value, ttl) in to_republish {
            debug!(key = %key, "republishing dht entry nearing expiry");
            self.replicate_value(&key, &value, ttl, now).await;
        }
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

fn hex_to_20(s: &str) -> [u8; ADDRESS_BYTES] {
    let mut out = [0u8; ADDRESS_BYTES];
    if let Ok(bytes) = hex::decode(s) {
        let n = bytes.len().min(ADDRESS_BYTES);
        out[..n].copy_from_slice(&bytes[..n]);
    }
    out
}

fn node_list_to_value(nodes: &[DhtNodeInfo]) -> Value {
    Value::List(
        nodes
            .iter()
            .map(|n| {
                let mut m = Payload::new();
                m.insert("node_id".into(), Value::Str(n.node_id.to_hex()));
                m.insert("address".into(), Value::Str(n.address.clone()));
                Value::Map(m)
            })
            .collect(),
    )
}

fn parse_node_list(list: &[Value]) -> Vec<DhtNodeInfo> {
    list.iter()
        .filter_map(|v| {
            let m = v.as_map()?;
            let node_id = NodeId::from_hex(m.get("node_id")?.as_str()?)?;
            let address = m.get("address")?.as_str()?.to_string();
            Some(DhtNodeInfo {
                node_id,
                address,
                last_seen: now_unix(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn id(byte: u8) -> NodeId {
        NodeId::from_public_key(&[byte; 32])
    }

    fn params() -> DhtParams {
        DhtParams {
            k: 20,
            alpha: 3,
            replication_factor: 3,
            ttl_default_secs: 3600.0,
            rpc_timeout: Duration::from_millis(500),
            max_lookup_iterations: 20,
        }
    }

    #[test]
    fn bucket_index_zero_for_identical_ids() {
        let distance = [0u8; ADDRESS_BYTES];
        assert_eq!(bucket_index_for_distance(&distance), 0);
    }

    #[test]
    fn bucket_index_159_for_max_distance() {
        let distance = [0xffu8; ADDRESS_BYTES];
        assert_eq!(bucket_index_for_distance(&distance), 159);
    }

    #[test]
    fn bucket_index_tracks_highest_set_bit() {
        let mut distance = [0u8; ADDRESS_BYTES];
        distance[19] = 0b0000_0001;
        assert_eq!(bucket_index_for_distance(&distance), 0);
        distance[19] = 0b1000_0000;
        assert_eq!(bucket_index_for_distance(&distance), 7);
    }

    #[test]
    fn kbucket_overflows_into_replacement_cache() {
        let mut bucket = KBucket::new(2);
        assert!(bucket.add_node(DhtNodeInfo { node_id: id(1), address: "a:1".into(), last_seen: 0.0 }));
        assert!(bucket.add_node(DhtNodeInfo { node_id: id(2), address: "a:2".into(), last_seen: 0.0 }));
        assert!(bucket.is_full());
        assert!(!bucket.add_node(DhtNodeInfo { node_id: id(3), address: "a:3".into(), last_seen: 0.0 }));
        assert_eq!(bucket.replacement_cache.len(), 1);
    }

    #[test]
    fn routing_table_excludes_self_and_finds_closest() {
        let self_id = DhtId::from_node_id(id(0));
        let mut table = RoutingTable::new(self_id, 20);
        assert!(!table.add_node(id(0), "self:0".into(), 0.0));
        for b in 1..10u8 {
            table.add_node(id(b), format!("a:{b}"), 0.0);
        }
        let target = DhtId::from_node_id(id(5));
        let closest = table.find_closest(&target, 3);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].node_id, id(5));
    }

    fn transport_stub() -> Arc<dyn DhtTransport> {
        struct NullTransport;
        #[async_trait]
        impl DhtTransport for NullTransport {
            async fn send_message(&self, _address: &str, _message: Message) -> Result<(), DhtError> {
                Ok(())
            }
        }
        Arc::new(NullTransport)
    }

    #[tokio::test]
    async fn local_store_then_retrieve_round_trips() {
        let dht = DistributedHashTable::new(id(0), "self:0".into(), params(), transport_stub());
        dht.store("user:1", b"alice".to_vec(), Some(60.0)).await;
        let got = dht.retrieve("user:1", true).await;
        assert_eq!(got, Some(b"alice".to_vec()));
    }

    #[tokio::test]
    async fn expired_local_value_is_dropped() {
        let dht = DistributedHashTable::new(id(0), "self:0".into(), params(), transport_stub());
        dht.store("k", b"v".to_vec(), Some(-1.0)).await;
        assert_eq!(dht.retrieve("k", true).await, None);
    }

    #[tokio::test]
    async fn delete_removes_local_entry() {
        let dht = DistributedHashTable::new(id(0), "self:0".into(), params(), transport_stub());
        dht.store("k", b"v".to_vec(), Some(60.0)).await;
        assert!(dht.delete("k").await);
        assert_eq!(dht.retrieve("k", true).await, None);
    }

    /// A loopback transport that routes messages directly to the `DistributedHashTable` whose
    /// address matches, so store/replicate and the iterative lookup can be exercised end to end
    /// without a real socket.
    struct LoopbackTransport {
        registry: StdMutex<HashMap<String, Arc<DistributedHashTable>>>,
    }

    impl LoopbackTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { registry: StdMutex::new(HashMap::new()) })
        }

        fn register(&self, address: &str, dht: Arc<DistributedHashTable>) {
            self.registry.lock().unwrap().insert(address.to_string(), dht);
        }
    }

    #[async_trait]
    impl DhtTransport for LoopbackTransport {
        async fn send_message(&self, address: &str, message: Message) -> Result<(), DhtError> {
            let target = self.registry.lock().unwrap().get(address).cloned();
            match target {
                Some(dht) => {
                    dht.handle_message(message).await;
                    Ok(())
                }
                None => Err(DhtError::Send),
            }
        }
    }

    #[tokio::test]
    async fn store_replicates_to_closest_known_node_which_answers_find_value() {
        let transport = LoopbackTransport::new();
        let a = Arc::new(DistributedHashTable::new(id(1), "a:1".into(), params(), transport.clone()));
        let b = Arc::new(DistributedHashTable::new(id(2), "a:2".into(), params(), transport.clone()));
        transport.register("a:1", a.clone());
        transport.register("a:2", b.clone());

        a.add_node(id(2), "a:2".into()).await;
        b.add_node(id(1), "a:1".into()).await;

        a.store("shared-key", b"hello".to_vec(), Some(60.0)).await;

        // b received a DHT_STORE replication RPC and now holds the value too.
        let direct = b.retrieve("shared-key", true).await;
        assert_eq!(direct, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn iterative_lookup_finds_value_on_remote_node() {
        let transport = LoopbackTransport::new();
        let a = Arc::new(DistributedHashTable::new(id(1), "a:1".into(), params(), transport.clone()));
        let b = Arc::new(DistributedHashTable::new(id(2), "a:2".into(), params(), transport.clone()));
        transport.register("a:1", a.clone());
        transport.register("a:2", b.clone());

        // a knows about b, but b does not know about a, so storing on b never replicates back
        // to a; a can only learn the value through a live FIND_VALUE round trip.
        a.add_node(id(2), "a:2".into()).await;

        b.store("remote-only", b"value".to_vec(), Some(60.0)).await;
        assert_eq!(a.retrieve("remote-only", true).await, None);

        let found = a.retrieve("remote-only", false).await;
        assert_eq!(found, Some(b"value".to_vec()));
    }
}
