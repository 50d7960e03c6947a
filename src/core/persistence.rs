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

//! The persistence collaborator: a trait describing the operations the core consumes, plus one
//! concrete `sled`-backed implementation (`SledStore`).
//!
//! Four logical tables, matching the schema the core expects on disk: `peers`, `messages_seen`,
//! `trust_events`, `network_state`. `SledStore` keeps each as its own `sled::Tree`, following the
//! same single-`sled::Db`, multiple-concern shape as the rest of this codebase's state layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{decode_canonical_limited, encode_canonical, CodecError, NodeId, PeerRecord};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying store could not be opened.
    #[error("store open")]
    Open,
    /// An I/O or storage-engine error occurred during a read/write.
    #[error("store io")]
    Io,
    /// A stored record failed to decode.
    #[error("corrupt record")]
    Codec(#[from] CodecError),
}

/// One row of a peer's trust event history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustEvent {
    /// Event kind label (e.g. `valid_message`, `timeout`).
    pub event_type: String,
    /// Signed trust delta applied by this event.
    pub trust_delta: f64,
    /// Unix-seconds timestamp.
    pub timestamp: f64,
    /// Free-form reason string.
    pub reason: String,
}

/// The persistence operations the core consumes. All operations are individually atomic; no
/// cross-operation transactional semantics are required.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Insert or replace a peer record, preserving its original `first_seen` if already stored.
    async fn save_peer(&self, peer: &PeerRecord) -> Result<(), StoreError>;
    /// Look up a single peer by id.
    async fn get_peer(&self, id: NodeId) -> Result<Option<PeerRecord>, StoreError>;
    /// All stored peers.
    async fn get_all_peers(&self) -> Result<Vec<PeerRecord>, StoreError>;
    /// Peers with `trust_score >= min`, highest first.
    async fn get_trusted_peers(&self, min: f64) -> Result<Vec<PeerRecord>, StoreError>;
    /// Overwrite a peer's trust score.
    async fn update_peer_trust(&self, id: NodeId, score: f64) -> Result<(), StoreError>;
    /// Remove a peer record.
    async fn remove_peer(&self, id: NodeId) -> Result<(), StoreError>;
    /// Additively bump a peer's valid/invalid message counters.
    async fn increment_peer_stats(
        &self,
        id: NodeId,
        valid: u64,
        invalid: u64,
    ) -> Result<(), StoreError>;

    /// Whether a message id has already been recorded as seen.
    async fn has_seen_message(&self, id: &str) -> Result<bool, StoreError>;
    /// Record a message id as seen, with the sender who delivered it.
    async fn mark_message_seen(&self, id: &str, sender: NodeId) -> Result<(), StoreError>;
    /// Drop seen-message records older than `max_age_s`.
    async fn cleanup_old_messages(&self, max_age_s: f64) -> Result<(), StoreError>;

    /// Append a trust event row for a peer.
    async fn log_trust_event(
        &self,
        id: NodeId,
        kind: &str,
        delta: f64,
        reason: &str,
    ) -> Result<(), StoreError>;
    /// Most recent `limit` trust events for a peer, newest first.
    async fn get_trust_history(&self, id: NodeId, limit: usize) -> Result<Vec<TrustEvent>, StoreError>;

    /// Store an arbitrary named state blob.
    async fn set_state(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    /// Retrieve a named state blob.
    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// `sled`-backed implementation of [`PersistenceStore`].
pub struct SledStore {
    peers: sled::Tree,
    messages_seen: sled::Tree,
    trust_events: sled::Tree,
    network_state: sled::Tree,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredMessageSeen {
    timestamp: f64,
    sender: NodeId,
}

impl SledStore {
    /// Open (or create) a `sled` database at `path`, with one tree per logical table.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|_| StoreError::Open)?;
        Ok(Self {
            peers: db.open_tree("peers").map_err(|_| StoreError::Open)?,
            messages_seen: db
                .open_tree("messages_seen")
                .map_err(|_| StoreError::Open)?,
            trust_events: db
                .open_tree("trust_events")
                .map_err(|_| StoreError::Open)?,
            network_state: db
                .open_tree("network_state")
                .map_err(|_| StoreError::Open)?,
        })
    }

    fn trust_event_key(id: NodeId, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + 8);
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn next_trust_event_seq(&self, id: NodeId) -> u64 {
        let prefix = id.as_bytes().to_vec();
        self.trust_events
            .scan_prefix(&prefix)
            .keys()
            .filter_map(|k| k.ok())
            .filter_map(|k| {
                if k.len() == 16 {
                    let mut seq_bytes = [0u8; 8];
                    seq_bytes.copy_from_slice(&k[8..16]);
                    Some(u64::from_be_bytes(seq_bytes))
                } else {
                    None
                }
            })
            .max()
            .map(|n| n + 1)
            .unwrap_or(0)
    }
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[async_trait]
impl PersistenceStore for SledStore {
    async fn save_peer(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        let mut record = peer.clone();
        if let Some(existing) = self.peers.get(record.node_id.as_bytes()).map_err(|_| StoreError::Io)? {
            let existing: PeerRecord = decode_canonical_limited(&existing, MAX_RECORD_BYTES)?;
            record.first_seen = existing.first_seen;
        }
        let bytes = encode_canonical(&record)?;
        self.peers
            .insert(record.node_id.as_bytes(), bytes)
            .map_err(|_| StoreError::Io)?;
        Ok(())
    }

    async fn get_peer(&self, id: NodeId) -> Result<Option<PeerRecord>, StoreError> {
        match self.peers.get(id.as_bytes()).map_err(|_| StoreError::Io)? {
            Some(bytes) => Ok(Some(decode_canonical_limited(&bytes, MAX_RECORD_BYTES)?)),
            None => Ok(None),
        }
    }

    async fn get_all_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let mut out = Vec::new();
        for item in self.peers.iter() {
            let (_, bytes) = item.map_err(|_| StoreError::Io)?;
            out.push(decode_canonical_limited(&bytes, MAX_RECORD_BYTES)?);
        }
        Ok(out)
    }

    async fn get_trusted_peers(&self, min: f64) -> Result<Vec<PeerRecord>, StoreError> {
        let mut peers = self.get_all_peers().await?;
        peers.retain(|p| p.trust_score >= min);
        peers.sort_by(|a, b| b.trust_score.partial_cmp(&a.trust_score).unwrap());
        Ok(peers)
    }

    async fn update_peer_trust(&self, id: NodeId, score: f64) -> Result<(), StoreError> {
        if let Some(mut peer) = self.get_peer(id).await? {
            peer.trust_score = score;
            self.save_peer(&peer).await?;
        }
        Ok(())
    }

    async fn remove_peer(&self, id: NodeId) -> Result<(), StoreError> {
        self.peers.remove(id.as_bytes()).map_err(|_| StoreError::Io)?;
        Ok(())
    }

    async fn increment_peer_stats(
        &self,
        id: NodeId,
        valid: u64,
        invalid: u64,
    ) -> Result<(), StoreError> {
        if let Some(mut peer) = self.get_peer(id).await? {
            peer.valid_messages = peer.valid_messages.saturating_add(valid);
            peer.invalid_messages = peer.invalid_messages.saturating_add(invalid);
            self.save_peer(&peer).await?;
        }
        Ok(())
    }

    async fn has_seen_message(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .messages_seen
            .contains_key(id.as_bytes())
            .map_err(|_| StoreError::Io)?)
    }

    async fn mark_message_seen(&self, id: &str, sender: NodeId) -> Result<(), StoreError> {
        if self.has_seen_message(id).await? {
            return Ok(());
        }
        let record = StoredMessageSeen {
            timestamp: now_unix(),
            sender,
        };
        let bytes = encode_canonical(&record)?;
        self.messages_seen
            .insert(id.as_bytes(), bytes)
            .map_err(|_| StoreError::Io)?;
        Ok(())
    }

    async fn cleanup_old_messages(&self, max_age_s: f64) -> Result<(), StoreError> {
        let cutoff = now_unix() - max_age_s;
        let mut stale = Vec::new();
        for item in self.messages_seen.iter() {
            let (key, bytes) = item.map_err(|_| StoreError::Io)?;
            let record: StoredMessageSeen = decode_canonical_limited(&bytes, MAX_RECORD_BYTES)?;
            if record.timestamp < cutoff {
                stale.push(key);
            }
        }
        for key in stale {
            self.messages_seen.remove(key).map_err(|_| StoreError::Io)?;
        }
        Ok(())
    }

    async fn log_trust_event(
        &self,
        id: NodeId,
        kind: &str,
        delta: f64,
        reason: &str,
    ) -> Result<(), StoreError> {
        let seq = self.next_trust_event_seq(id);
        let event = TrustEvent {
            event_type: kind.to_string(),
            trust_delta: delta,
            timestamp: now_unix(),
            reason: reason.to_string(),
        };
        let bytes = encode_canonical(&event)?;
        self.trust_events
            .insert(Self::trust_event_key(id, seq), bytes)
            .map_err(|_| StoreError::Io)?;
        Ok(())
    }

    async fn get_trust_history(&self, id: NodeId, limit: usize) -> Result<Vec<TrustEvent>, StoreError> {
        let prefix = id.as_bytes().to_vec();
        let mut events = Vec::new();
        for item in self.trust_events.scan_prefix(&prefix) {
            let (_, bytes) = item.map_err(|_| StoreError::Io)?;
            events.push(decode_canonical_limited::<TrustEvent>(&bytes, MAX_RECORD_BYTES)?);
        }
        // Insertion order is already chronological (sequence-suffixed keys); newest first.
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn set_state(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.network_state
            .insert(key.as_bytes(), value)
            .map_err(|_| StoreError::Io)?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .network_state
            .get(key.as_bytes())
            .map_err(|_| StoreError::Io)?
            .map(|v| v.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer(id_byte: u8) -> PeerRecord {
        PeerRecord {
            node_id: NodeId::from_public_key(&[id_byte; 32]),
            address: "127.0.0.1:9000".to_string(),
            public_key: vec![id_byte; 32],
            last_seen: 1000.0,
            trust_score: 0.5,
            first_seen: 1000.0,
            connection_count: 0,
            valid_messages: 0,
            invalid_messages: 0,
        }
    }

    #[tokio::test]
    async fn save_and_get_peer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db").to_str().unwrap()).unwrap();
        let peer = sample_peer(1);
        store.save_peer(&peer).await.unwrap();
        let got = store.get_peer(peer.node_id).await.unwrap().unwrap();
        assert_eq!(got.address, peer.address);
    }

    #[tokio::test]
    async fn save_peer_preserves_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db").to_str().unwrap()).unwrap();
        let mut peer = sample_peer(2);
        store.save_peer(&peer).await.unwrap();
        peer.first_seen = 9999.0;
        peer.trust_score = 0.9;
        store.save_peer(&peer).await.unwrap();
        let got = store.get_peer(peer.node_id).await.unwrap().unwrap();
        assert_eq!(got.first_seen, 1000.0);
        assert_eq!(got.trust_score, 0.9);
    }

    #[tokio::test]
    async fn message_seen_roundtrip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db").to_str().unwrap()).unwrap();
        let sender = NodeId::from_public_key(&[7u8; 32]);
        assert!(!store.has_seen_message("abc123").await.unwrap());
        store.mark_message_seen("abc123", sender).await.unwrap();
        assert!(store.has_seen_message("abc123").await.unwrap());
        store.cleanup_old_messages(0.0).await.unwrap();
    }

    #[tokio::test]
    async fn trust_history_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db").to_str().unwrap()).unwrap();
        let id = NodeId::from_public_key(&[3u8; 32]);
        store.log_trust_event(id, "valid_message", 0.001, "a").await.unwrap();
        store.log_trust_event(id, "valid_message", 0.001, "b").await.unwrap();
        let hist = store.get_trust_history(id, 10).await.unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].reason, "b");
    }
}
