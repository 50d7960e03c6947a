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

//! Peer membership: known/active/connecting peer sets, admission control with trust-based
//! eviction, liveness sweeps, and discovery ordering.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::core::persistence::{PersistenceStore, StoreError};
use crate::core::types::{NodeId, PeerRecord};

/// Tuning knobs for [`PeerManager`], mirroring the relevant
/// [`crate::core::config::NodeConfig`] fields.
#[derive(Clone, Copy, Debug)]
pub struct PeerManagerParams {
    /// Maximum size of the active peer set.
    pub max_peers: usize,
    /// Peer count below which discovery actively seeks more peers.
    pub min_peers: usize,
    /// Seconds of inactivity after which a peer is evicted.
    pub peer_timeout_secs: f64,
    /// Trust floor a known-but-inactive peer must clear to be worth redialing.
    pub min_trust_threshold: f64,
}

/// Connectivity state of one entry in the peer table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnState {
    /// Known by address but no live connection.
    Known,
    /// Dial in progress.
    Connecting,
    /// Live, handshaked connection.
    Active,
}

struct Entry {
    record: PeerRecord,
    conn_state: PeerConnState,
}

/// Tracks every peer this node knows about and which of them it is actively talking to.
pub struct PeerManager {
    self_id: NodeId,
    store: Arc<dyn PersistenceStore>,
    params: PeerManagerParams,
    bootstrap: Vec<String>,
    peers: tokio::sync::RwLock<HashMap<NodeId, Entry>>,
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl PeerManager {
    /// Build a peer manager, pre-loading known peers from the persistence collaborator.
    pub async fn new(
        self_id: NodeId,
        store: Arc<dyn PersistenceStore>,
        params: PeerManagerParams,
        bootstrap: Vec<String>,
    ) -> Result<Self, StoreError> {
        let mut peers = HashMap::new();
        for record in store.get_all_peers().await? {
            if record.node_id == self_id {
                continue;
            }
            peers.insert(
                record.node_id,
                Entry {
                    record,
                    conn_state: PeerConnState::Known,
                },
            );
        }
        Ok(Self {
            self_id,
            store,
            params,
            bootstrap,
            peers: tokio::sync::RwLock::new(peers),
        })
    }

    /// Bootstrap addresses configured at startup.
    pub fn bootstrap_nodes(&self) -> &[String] {
        &self.bootstrap
    }

    /// Add or refresh a peer record. Self-announcements are ignored. If the active set is full
    /// and this is a new peer, the lowest-trust active peer is evicted to make room; if even that
    /// peer outranks the newcomer, the newcomer is kept as `Known` but not admitted to `Active`.
    pub async fn add_peer(
        &self,
        node_id: NodeId,
        address: String,
        public_key: Vec<u8>,
        initial_trust: f64,
        mark_active: bool,
    ) -> Result<(), StoreError> {
        if node_id == self.self_id {
            return Ok(());
        }

        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(&node_id) {
            entry.record.address = address;
            entry.record.last_seen = now_unix();
            if mark_active {
                entry.conn_state = PeerConnState::Active;
            }
            self.store.save_peer(&entry.record).await?;
            return Ok(());
        }

        let active_count = peers
            .values()
            .filter(|e| e.conn_state == PeerConnState::Active)
            .count();
        let admit = !mark_active || active_count < self.params.max_peers || {
            if let Some(evict) = Self::lowest_trust_active(&peers) {
                let should_evict = initial_trust > evict.1;
                if should_evict {
                    peers.get_mut(&evict.0).unwrap().conn_state = PeerConnState::Known;
                    info!(peer = %evict.0, "evicted lowest-trust active peer to admit newcomer");
                }
                should_evict
            } else {
                false
            }
        };

        let now = now_unix();
        let record = PeerRecord {
            node_id,
            address,
            public_key,
            last_seen: now,
            trust_score: initial_trust,
            first_seen: now,
            connection_count: 0,
            valid_messages: 0,
            invalid_messages: 0,
        };
        self.store.save_peer(&record).await?;
        peers.insert(
            node_id,
            Entry {
                record,
                conn_state: if mark_active && admit {
                    PeerConnState::Active
                } else {
                    PeerConnState::Known
                },
            },
        );
        Ok(())
    }

    fn lowest_trust_active(peers: &HashMap<NodeId, Entry>) -> Option<(NodeId, f64)> {
        peers
            .iter()
            .filter(|(_, e)| e.conn_state == PeerConnState::Active)
            .map(|(id, e)| (*id, e.record.trust_score))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
    }

    /// Drop a peer entirely.
    pub async fn remove_peer(&self, node_id: NodeId) -> Result<(), StoreError> {
        self.peers.write().await.remove(&node_id);
        self.store.remove_peer(node_id).await
    }

    /// Mark connecting.
    pub async fn mark_connecting(&self, node_id: NodeId, address: String, public_key: Vec<u8>) {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&node_id) {
            Some(entry) => entry.conn_state = PeerConnState::Connecting,
            None => {
                let now = now_unix();
                peers.insert(
                    node_id,
                    Entry {
                        record: PeerRecord {
                            node_id,
                            address,
                            public_key,
                            last_seen: now,
                            trust_score: 0.0,
                            first_seen: now,
                            connection_count: 0,
                            valid_messages: 0,
                            invalid_messages: 0,
                        },
                        conn_state: PeerConnState::Connecting,
                    },
                );
            }
        }
    }

    /// Refresh `last_seen` for a peer, bumping `connection_count` the first time activity is
    /// observed after a (re)connect.
    pub async fn update_peer_activity(&self, node_id: NodeId) -> Result<(), StoreError> {
        let mut peers = self.peers.write().await;
        if let Some(entry) = peers.get_mut(&node_id) {
            entry.record.last_seen = now_unix();
            entry.record.connection_count += 1;
            self.store.save_peer(&entry.record).await?;
        }
        Ok(())
    }

    /// Look up one peer's record.
    pub async fn get_peer(&self, node_id: NodeId) -> Option<PeerRecord> {
        self.peers.read().await.get(&node_id).map(|e| e.record.clone())
    }

    /// All peers in the `Active` state.
    pub async fn get_active_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .await
            .values()
            .filter(|e| e.conn_state == PeerConnState::Active)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Up to `count` random active peers, excluding `exclude`.
    pub async fn get_random_peers(&self, count: usize, exclude: &[NodeId]) -> Vec<PeerRecord> {
        let peers = self.peers.read().await;
        let mut candidates: Vec<PeerRecord> = peers
            .values()
            .filter(|e| e.conn_state == PeerConnState::Active)
            .map(|e| e.record.clone())
            .filter(|r| !exclude.contains(&r.node_id))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        candidates
    }

    /// Active peers at or above `min_trust`.
    pub async fn get_trusted_peers(&self, min_trust: f64) -> Vec<PeerRecord> {
        self.peers
            .read()
            .await
            .values()
            .filter(|e| e.conn_state == PeerConnState::Active && e.record.trust_score >= min_trust)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Whether the active set is below `min_peers`.
    pub async fn needs_more_peers(&self) -> bool {
        self.get_active_peers().await.len() < self.params.min_peers
    }

    /// Whether the active set still has room below `max_peers`.
    pub async fn can_accept_peers(&self) -> bool {
        self.get_active_peers().await.len() < self.params.max_peers
    }

    /// Candidates for the next discovery round: unconnected bootstrap nodes first, then known
    /// (disconnected) peers clearing `min_trust_threshold`, ranked by `(trust desc, recency
    /// desc)`, top 5.
    pub async fn discover_peers(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        let connected_addrs: std::collections::HashSet<&str> = peers
            .values()
            .filter(|e| e.conn_state != PeerConnState::Known)
            .map(|e| e.record.address.as_str())
            .collect();

        let mut out: Vec<String> = self
            .bootstrap
            .iter()
            .filter(|addr| !connected_addrs.contains(addr.as_str()))
            .cloned()
            .collect();

        let mut known: Vec<&Entry> = peers
            .values()
            .filter(|e| {
                e.conn_state == PeerConnState::Known
                    && e.record.trust_score >= self.params.min_trust_threshold
            })
            .collect();
        known.sort_by(|a, b| {
            b.record
                .trust_score
                .partial_cmp(&a.record.trust_score)
                .unwrap()
                .then(b.record.last_seen.partial_cmp(&a.record.last_seen).unwrap())
        });
        out.extend(known.into_iter().take(5).map(|e| e.record.address.clone()));
        out
    }

    /// Evict active peers idle longer than `peer_timeout_secs`; returns the evicted node ids so
    /// the caller can apply a trust penalty and drop their transport connection.
    pub async fn sweep_timeouts(&self) -> Vec<NodeId> {
        let now = now_unix();
        let mut peers = self.peers.write().await;
        let stale: Vec<NodeId> = peers
            .iter()
            .filter(|(_, e)| {
                e.conn_state == PeerConnState::Active
                    && now - e.record.last_seen > self.params.peer_timeout_secs
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(entry) = peers.get_mut(id) {
                entry.conn_state = PeerConnState::Known;
            }
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "evicted timed-out peers");
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::SledStore;

    fn id(byte: u8) -> NodeId {
        NodeId::from_public_key(&[byte; 32])
    }

    async fn manager(bootstrap: Vec<String>) -> (PeerManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn PersistenceStore> =
            Arc::new(SledStore::open(dir.path().join("db").to_str().unwrap()).unwrap());
        let params = PeerManagerParams {
            max_peers: 3,
            min_peers: 2,
            peer_timeout_secs: 60.0,
            min_trust_threshold: 0.1,
        };
        let mgr = PeerManager::new(id(0), store, params, bootstrap).await.unwrap();
        (mgr, dir)
    }

    #[tokio::test]
    async fn self_announcement_is_ignored() {
        let (mgr, _dir) = manager(vec![]).await;
        mgr.add_peer(id(0), "x:1".into(), vec![], 0.5, true).await.unwrap();
        assert!(mgr.get_peer(id(0)).await.is_none());
    }

    #[tokio::test]
    async fn admits_peers_up_to_max_then_evicts_lowest_trust() {
        let (mgr, _dir) = manager(vec![]).await;
        mgr.add_peer(id(1), "a:1".into(), vec![], 0.2, true).await.unwrap();
        mgr.add_peer(id(2), "a:2".into(), vec![], 0.5, true).await.unwrap();
        mgr.add_peer(id(3), "a:3".into(), vec![], 0.9, true).await.unwrap();
        assert_eq!(mgr.get_active_peers().await.len(), 3);

        // a newcomer with higher trust than the weakest active peer evicts it
        mgr.add_peer(id(4), "a:4".into(), vec![], 0.95, true).await.unwrap();
        let active_ids: Vec<NodeId> = mgr.get_active_peers().await.iter().map(|p| p.node_id).collect();
        assert!(!active_ids.contains(&id(1)));
        assert!(active_ids.contains(&id(4)));
    }

    #[tokio::test]
    async fn needs_more_peers_reflects_min_peers() {
        let (mgr, _dir) = manager(vec![]).await;
        assert!(mgr.needs_more_peers().await);
        mgr.add_peer(id(1), "a:1".into(), vec![], 0.5, true).await.unwrap();
        mgr.add_peer(id(2), "a:2".into(), vec![], 0.5, true).await.unwrap();
        assert!(!mgr.needs_more_peers().await);
    }

    #[tokio::test]
    async fn discovery_prefers_unconnected_bootstrap_then_trusted_known() {
        let (mgr, _dir) = manager(vec!["boot:1".into()]).await;
        mgr.add_peer(id(1), "a:1".into(), vec![], 0.8, false).await.unwrap();
        let discovered = mgr.discover_peers().await;
        assert_eq!(discovered[0], "boot:1");
        assert!(discovered.contains(&"a:1".to_string()));
    }

    #[tokio::test]
    async fn sweep_timeouts_evicts_stale_active_peers() {
        let (mgr, _dir) = manager(vec![]).await;
        mgr.add_peer(id(1), "a:1".into(), vec![], 0.5, true).await.unwrap();
        {
            let mut peers = mgr.peers.write().await;
            peers.get_mut(&id(1)).unwrap().record.last_seen = 0.0;
        }
        let evicted = mgr.sweep_timeouts().await;
        assert_eq!(evicted, vec![id(1)]);
        assert!(mgr.get_active_peers().await.is_empty());
    }
}
